mod firebase;
mod memory;
mod redis;

pub use self::memory::MemoryStore;

use async_trait::async_trait;
use log::{ info, warn };
use serde::{ Deserialize, Serialize };
use std::error::Error;
use std::sync::Arc;

use crate::cli::Args;
use crate::error::StoreError;
use crate::models::analysis::{ AnalysisId, AnalysisRecord };
use crate::models::chat::ChatMessage;
use crate::upload::ImageUpload;

pub const ANALYSES_PATH: &str = "ecg_analyses";
pub const CHATS_PATH: &str = "ecg_chats";
const UNKNOWN_PATIENT: &str = "unknown";

/// Analysis as written to the document store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredAnalysis {
    pub timestamp: String,
    pub image_name: String,
    #[serde(default)]
    pub image_base64: String,
    pub report: String,
    #[serde(default = "unknown_patient")]
    pub patient_id: String,
    #[serde(default = "analysis_type")]
    pub analysis_type: String,
}

fn unknown_patient() -> String {
    UNKNOWN_PATIENT.to_string()
}

fn analysis_type() -> String {
    "ECG".to_string()
}

impl StoredAnalysis {
    pub fn from_record(record: &AnalysisRecord, image: &ImageUpload, thumbnail_chars: usize) -> Self {
        Self {
            timestamp: record.timestamp.clone(),
            image_name: record.image_name.clone(),
            image_base64: image.thumbnail(thumbnail_chars),
            report: record.report.clone(),
            patient_id: record.patient_id.clone().unwrap_or_else(unknown_patient),
            analysis_type: analysis_type(),
        }
    }

    /// Session-side record for a stored entry, with a fresh session id.
    pub fn into_record(self, store_id: String) -> AnalysisRecord {
        AnalysisRecord {
            id: AnalysisId::new(),
            timestamp: self.timestamp,
            image_name: self.image_name,
            report: self.report,
            persisted_id: Some(store_id),
            patient_id: Some(self.patient_id).filter(|p| p != UNKNOWN_PATIENT),
        }
    }
}

/// Chat message as written to the document store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredChat {
    pub timestamp: String,
    pub analysis_id: String,
    pub role: String,
    pub content: String,
}

impl StoredChat {
    pub fn from_message(message: &ChatMessage, analysis_store_id: &str) -> Self {
        Self {
            timestamp: message.timestamp.clone(),
            analysis_id: analysis_store_id.to_string(),
            role: message.role.to_string(),
            content: message.content.clone(),
        }
    }
}

/// Orders `(store_id, entry)` pairs by timestamp and keeps the newest `limit`.
pub(crate) fn newest_records(mut entries: Vec<(String, StoredAnalysis)>, limit: usize) -> Vec<AnalysisRecord> {
    entries.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp).then_with(|| a.0.cmp(&b.0)));
    let start = entries.len().saturating_sub(limit);
    entries
        .into_iter()
        .skip(start)
        .map(|(key, stored)| stored.into_record(key))
        .collect()
}

#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Returns the store-assigned key.
    async fn save_analysis(&self, analysis: &StoredAnalysis) -> Result<String, StoreError>;

    /// Up to `limit` most recent analyses, oldest first, optionally for one patient.
    async fn load_analyses(
        &self,
        patient_id: Option<&str>,
        limit: usize
    ) -> Result<Vec<AnalysisRecord>, StoreError>;

    async fn save_chat_message(&self, chat: &StoredChat) -> Result<(), StoreError>;

    fn describe(&self) -> String;
}

pub async fn create_store(
    args: &Args
) -> Result<Option<Arc<dyn AnalysisStore>>, Box<dyn Error + Send + Sync>> {
    match args.store_type.to_lowercase().as_str() {
        "none" | "" => Ok(None),
        "memory" => Ok(Some(Arc::new(MemoryStore::default()))),
        "firebase" => {
            let store = firebase::FirebaseStore::connect(
                &args.firebase_database_url,
                args.firebase_sa_key_path.as_deref()
            ).await?;
            Ok(Some(Arc::new(store)))
        }
        "redis" => {
            let store = redis::RedisStore::new(&args.redis_url, &args.redis_prefix)?;
            Ok(Some(Arc::new(store)))
        }
        _ =>
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported store type: {}", args.store_type)
                    )
                )
            ),
    }
}

pub async fn initialize_store(
    args: &Args
) -> Result<Option<Arc<dyn AnalysisStore>>, Box<dyn Error + Send + Sync>> {
    let store = create_store(args).await?;
    match &store {
        Some(s) => info!("Analyses and chats will be stored in: {}", s.describe()),
        None => warn!("No store configured. Analyses live only for the browser session."),
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::sample_png;

    fn stored(ts: &str) -> StoredAnalysis {
        StoredAnalysis {
            timestamp: ts.into(),
            image_name: format!("{}.png", ts),
            image_base64: String::new(),
            report: "r".into(),
            patient_id: "unknown".into(),
            analysis_type: "ECG".into(),
        }
    }

    #[test]
    fn stored_analysis_uses_thumbnail_and_unknown_patient() {
        let image = ImageUpload::new("a.png", None, sample_png(), 1024).unwrap();
        let record = AnalysisRecord::new("a.png", "report".into(), None);
        let s = StoredAnalysis::from_record(&record, &image, 12);
        assert_eq!(s.image_base64.len(), 12);
        assert_eq!(s.patient_id, "unknown");
        assert_eq!(s.analysis_type, "ECG");

        let back = s.into_record("-Nkey".into());
        assert_eq!(back.persisted_id.as_deref(), Some("-Nkey"));
        assert!(back.patient_id.is_none());
        assert_ne!(back.id, record.id);
    }

    #[test]
    fn newest_records_keeps_tail_in_order() {
        let entries = vec![
            ("c".to_string(), stored("2024-01-03 00:00:00")),
            ("a".to_string(), stored("2024-01-01 00:00:00")),
            ("b".to_string(), stored("2024-01-02 00:00:00"))
        ];
        let records = newest_records(entries, 2);
        let keys: Vec<_> = records.iter().map(|r| r.persisted_id.clone().unwrap()).collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn stored_analysis_tolerates_missing_optional_fields() {
        let s: StoredAnalysis = serde_json::from_str(
            r#"{"timestamp":"t","image_name":"i","report":"r"}"#
        ).unwrap();
        assert_eq!(s.patient_id, "unknown");
        assert_eq!(s.image_base64, "");
    }

    #[tokio::test]
    async fn create_store_by_type() {
        use clap::Parser;
        let args = Args::parse_from(["ecg-analyzer", "--store-type", "memory"]);
        assert!(create_store(&args).await.unwrap().is_some());

        let args = Args::parse_from(["ecg-analyzer", "--store-type", "none"]);
        assert!(create_store(&args).await.unwrap().is_none());

        let args = Args::parse_from(["ecg-analyzer", "--store-type", "mongo"]);
        assert!(create_store(&args).await.is_err());
    }
}
