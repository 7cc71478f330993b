use async_trait::async_trait;
use serde::{ Deserialize, Serialize };
use log::{ info, error };

use super::{ InferenceClient, LlmConfig };
use crate::error::InferenceError;
use crate::upload::ImageUpload;

#[derive(Serialize)]
struct GenerateContentRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        inline_data: InlineData,
    },
}

#[derive(Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
}

#[derive(Deserialize)]
struct GoogleCandidate {
    content: Option<GoogleContent>,
}

#[derive(Deserialize)]
struct GoogleContent {
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Deserialize)]
struct GooglePart {
    text: Option<String>,
}

/// Joins the text parts of the first candidate.
fn extract_text(response: GenerateContentResponse) -> Result<String, InferenceError> {
    let text: String = response.candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(InferenceError("model returned no text".to_string()));
    }
    Ok(text)
}

pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            model,
            base_url,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, InferenceError> {
        if config.model.trim().is_empty() {
            return Err(InferenceError("Gemini model name is empty".to_string()));
        }
        Ok(Self::new(config.api_key.clone(), config.model.clone(), config.base_url.clone()))
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url.trim_end_matches('/'), self.model)
    }

    async fn generate(&self, parts: Vec<GeminiPart>) -> Result<String, InferenceError> {
        let payload = GenerateContentRequest {
            contents: vec![GeminiContent { role: "user", parts }],
        };

        let resp = self.http
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!("Gemini request failed with status {}: {}", status, body);
            return Err(InferenceError(format!("status {}", status)));
        }

        let parsed: GenerateContentResponse = resp.json().await?;
        extract_text(parsed)
    }
}

#[async_trait]
impl InferenceClient for GeminiClient {
    async fn interpret_image(
        &self,
        instruction: &str,
        image: &ImageUpload
    ) -> Result<String, InferenceError> {
        info!(
            "GeminiClient::interpret_image() → model={} image={} ({} bytes)",
            self.model,
            image.file_name,
            image.size()
        );
        let parts = vec![
            GeminiPart::Text { text: instruction.to_string() },
            GeminiPart::InlineData {
                inline_data: InlineData {
                    mime_type: image.mime_type.clone(),
                    data: image.to_base64(),
                },
            }
        ];
        self.generate(parts).await
    }

    async fn generate_text(&self, prompt: &str) -> Result<String, InferenceError> {
        info!("GeminiClient::generate_text() → model={} prompt_len={}", self.model, prompt.len());
        self.generate(vec![GeminiPart::Text { text: prompt.to_string() }]).await
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }
}
