use serde::Deserialize;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use log::info;

use crate::models::analysis::AnalysisRecord;
use crate::models::chat::{ ChatMessage, Role };

pub const ANALYSIS_INSTRUCTION: &str = "analysis_instruction";
pub const COMPARISON: &str = "comparison";
pub const CHAT: &str = "chat";

const DEFAULT_ANALYSIS_INSTRUCTION: &str = "As a senior cardiologist, analyze this ECG report with:
1. Basic Parameters (HR, rhythm, intervals)
2. Rhythm Analysis
3. Axis Determination
4. Waveform Abnormalities
5. Clinical Interpretation
6. Recommendations

Use medical terminology with only main points";

const DEFAULT_COMPARISON: &str = "Compare these two ECG reports and identify clinically significant changes:

PAST REPORT ({past_timestamp}):
{past_report}

CURRENT REPORT:
{current_report}

Provide:
1. Summary of key changes
2. Clinical significance
3. Urgency level
4. Recommended follow-up actions";

const DEFAULT_CHAT: &str = "As a cardiology assistant, answer this ECG-related question:
Question: {question}

Context:
Current ECG Analysis:
{report}

Chat History:
{history}

Guidelines:
- Be professional but approachable
- Explain medical terms simply
- If unsure, recommend consulting a cardiologist
- Never provide definitive diagnoses";

#[derive(Debug)]
pub enum PromptError {
    TemplateNotFound(String),
    IoError(std::io::Error),
    JsonError(serde_json::Error),
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::TemplateNotFound(key) => write!(f, "Prompt template '{}' not found", key),
            PromptError::IoError(e) => write!(f, "Prompt file IO error: {}", e),
            PromptError::JsonError(e) => write!(f, "Prompt JSON parsing error: {}", e),
        }
    }
}

impl Error for PromptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PromptError::IoError(e) => Some(e),
            PromptError::JsonError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PromptError {
    fn from(err: std::io::Error) -> Self {
        PromptError::IoError(err)
    }
}

impl From<serde_json::Error> for PromptError {
    fn from(err: serde_json::Error) -> Self {
        PromptError::JsonError(err)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct PromptConfig {
    pub analysis_instruction: String,
    pub comparison: String,
    pub chat: String,
    #[serde(skip)]
    pub last_loaded: Option<SystemTime>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            analysis_instruction: DEFAULT_ANALYSIS_INSTRUCTION.to_string(),
            comparison: DEFAULT_COMPARISON.to_string(),
            chat: DEFAULT_CHAT.to_string(),
            last_loaded: None,
        }
    }
}

impl PromptConfig {
    fn validate(&self) -> Result<(), PromptError> {
        for (key, template) in [
            (ANALYSIS_INSTRUCTION, &self.analysis_instruction),
            (COMPARISON, &self.comparison),
            (CHAT, &self.chat),
        ] {
            if template.trim().is_empty() {
                return Err(PromptError::TemplateNotFound(key.to_string()));
            }
        }
        Ok(())
    }
}

/// Raw file shape. Every template is optional so that the error names the missing key.
#[derive(Deserialize)]
struct PromptFile {
    analysis_instruction: Option<String>,
    comparison: Option<String>,
    chat: Option<String>,
}

pub fn load_prompts_from_str(json: &str) -> Result<Arc<PromptConfig>, PromptError> {
    let file: PromptFile = serde_json::from_str(json)?;
    let config = PromptConfig {
        analysis_instruction: file.analysis_instruction
            .ok_or_else(|| PromptError::TemplateNotFound(ANALYSIS_INSTRUCTION.to_string()))?,
        comparison: file.comparison
            .ok_or_else(|| PromptError::TemplateNotFound(COMPARISON.to_string()))?,
        chat: file.chat.ok_or_else(|| PromptError::TemplateNotFound(CHAT.to_string()))?,
        last_loaded: Some(SystemTime::now()),
    };
    config.validate()?;
    Ok(Arc::new(config))
}

pub fn load_prompts<P: AsRef<Path>>(path: P) -> Result<Arc<PromptConfig>, PromptError> {
    let file_content = fs::read_to_string(&path)?;
    load_prompts_from_str(&file_content)
}

/// Loads from `path` when given, otherwise the built-in prompts.
pub fn initialize_prompts(path: Option<&str>) -> Result<Arc<PromptConfig>, PromptError> {
    match path {
        Some(p) if !p.trim().is_empty() => {
            info!("Loading prompts from: {}", p);
            load_prompts(p)
        }
        _ => {
            info!("Using built-in prompts");
            Ok(Arc::new(PromptConfig::default()))
        }
    }
}

pub fn reload_prompts_if_changed<P: AsRef<Path>>(
    path: P,
    current_config: &Arc<PromptConfig>
) -> Result<Option<Arc<PromptConfig>>, PromptError> {
    let metadata = fs::metadata(&path)?;

    if let Ok(modified) = metadata.modified() {
        match current_config.last_loaded {
            Some(last_loaded) if modified <= last_loaded => {}
            Some(_) => {
                info!("Prompts file changed, reloading...");
                return load_prompts(path).map(Some);
            }
            None => {
                info!("No last_loaded timestamp, reloading prompts...");
                return load_prompts(path).map(Some);
            }
        }
    }
    Ok(None)
}

pub fn format_history_for_prompt(messages: &[ChatMessage]) -> String {
    if messages.is_empty() {
        return String::from("(no previous messages)");
    }
    let mut result = String::new();
    for msg in messages {
        let role_display = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        result.push_str(&format!("{}: {}\n", role_display, msg.content));
    }
    result
}

pub fn get_analysis_instruction(config: &PromptConfig) -> &str {
    &config.analysis_instruction
}

pub fn get_comparison_prompt(
    config: &PromptConfig,
    past: &AnalysisRecord,
    current: &AnalysisRecord
) -> String {
    config.comparison
        .replace("{past_timestamp}", &past.timestamp)
        .replace("{current_timestamp}", &current.timestamp)
        .replace("{past_report}", &past.report)
        .replace("{current_report}", &current.report)
}

pub fn get_chat_prompt(
    config: &PromptConfig,
    report: &str,
    history: &[ChatMessage],
    question: &str
) -> String {
    config.chat
        .replace("{history}", &format_history_for_prompt(history))
        .replace("{report}", report)
        .replace("{question}", question)
}
