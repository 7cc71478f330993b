pub mod gemini;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::InferenceError;
use crate::upload::ImageUpload;
use self::gemini::GeminiClient;

/// Remote model adapter. Two request/response calls, no local model logic,
/// no caching or retries.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn interpret_image(
        &self,
        instruction: &str,
        image: &ImageUpload
    ) -> Result<String, InferenceError>;

    async fn generate_text(&self, prompt: &str) -> Result<String, InferenceError>;

    fn get_model(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn InferenceClient>, InferenceError> {
    if config.api_key.trim().is_empty() {
        return Err(InferenceError("GEMINI_API_KEY is required".to_string()));
    }
    let client = GeminiClient::from_config(config)?;
    Ok(Arc::new(client))
}
