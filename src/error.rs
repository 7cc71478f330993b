use thiserror::Error;

use crate::config::prompt::PromptError;

/// Failure of a call to the remote model. Network, auth, quota and
/// malformed replies all end up here without further distinction.
#[derive(Debug, Error)]
#[error("inference request failed: {0}")]
pub struct InferenceError(pub String);

impl From<reqwest::Error> for InferenceError {
    fn from(err: reqwest::Error) -> Self {
        InferenceError(err.to_string())
    }
}

/// Failure of a persistence backend.
#[derive(Debug, Error)]
#[error("store operation failed: {0}")]
pub struct StoreError(pub String);

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError(err.to_string())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError(format!("invalid record: {}", err))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("uploaded file is empty")]
    Empty,
    #[error("uploaded file is not valid base64")]
    InvalidEncoding,
    #[error("unsupported image format, expected JPEG or PNG")]
    UnsupportedFormat,
    #[error("image is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Please upload an ECG report image first")]
    NoUpload,
    #[error("Please analyze an ECG report first")]
    NoCurrentAnalysis,
    #[error("No previous analyses found. Please analyze an ECG first")]
    EmptyHistory,
    #[error("No analysis matches the selection '{0}'")]
    UnknownRecord(String),
    #[error("Message is empty")]
    EmptyMessage,
    #[error("No database is configured")]
    StoreUnavailable,
    #[error("Invalid upload: {0}")]
    Upload(#[from] UploadError),
    #[error("{0}")]
    Inference(#[from] InferenceError),
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Prompt(#[from] PromptError),
}

impl WorkflowError {
    /// Precondition failures are shown as warnings; nothing was attempted.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            WorkflowError::NoUpload
                | WorkflowError::NoCurrentAnalysis
                | WorkflowError::EmptyHistory
                | WorkflowError::UnknownRecord(_)
                | WorkflowError::EmptyMessage
                | WorkflowError::StoreUnavailable
        )
    }
}
