use serde::{ Serialize, Deserialize };
use std::fmt;

use super::analysis::{ timestamp_now, AnalysisId };

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: String,
    pub analysis_id: AnalysisId,
}

impl ChatMessage {
    pub fn user(content: &str, analysis_id: AnalysisId) -> Self {
        Self::new(Role::User, content, analysis_id)
    }

    pub fn assistant(content: &str, analysis_id: AnalysisId) -> Self {
        Self::new(Role::Assistant, content, analysis_id)
    }

    fn new(role: Role, content: &str, analysis_id: AnalysisId) -> Self {
        Self {
            role,
            content: content.to_string(),
            timestamp: timestamp_now(),
            analysis_id,
        }
    }
}
