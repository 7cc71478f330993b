use serde::{ Serialize, Deserialize };

use super::analysis::{ AnalysisId, AnalysisRecord };
use super::chat::ChatMessage;
use crate::session::UploadState;

/// How the browser points at a past analysis.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum RecordSelector {
    Id {
        id: AnalysisId,
    },
    /// 1-indexed position as shown in the history listing.
    Position {
        position: usize,
    },
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "set_patient")] SetPatient {
        patient_id: String,
    },
    #[serde(rename = "upload")] Upload {
        file_name: String,
        #[serde(default)]
        mime_type: Option<String>,
        /// Base64 image bytes, optionally as a `data:` URL.
        data: String,
    },
    #[serde(rename = "analyze")]
    Analyze,
    #[serde(rename = "compare")] Compare {
        past: RecordSelector,
    },
    #[serde(rename = "chat")] Chat {
        content: String,
    },
    #[serde(rename = "load_history")]
    LoadHistory,
    #[serde(rename = "history")]
    History,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub id: AnalysisId,
    pub position: usize,
    pub label: String,
    pub timestamp: String,
    pub image_name: String,
    pub report: String,
}

/// Outcome of a background persistence write, delivered to the owning
/// connection on its own channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind")]
pub enum PersistenceEvent {
    #[serde(rename = "analysis_saved")] AnalysisSaved {
        analysis_id: AnalysisId,
        store_id: String,
    },
    #[serde(rename = "analysis_failed")] AnalysisFailed {
        analysis_id: AnalysisId,
        message: String,
    },
    #[serde(rename = "chat_failed")] ChatFailed {
        analysis_id: AnalysisId,
        message: String,
    },
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "uploaded")] Uploaded {
        image_name: String,
        mime_type: String,
        size: usize,
    },
    #[serde(rename = "processing")] Processing {
        action: String,
    },
    #[serde(rename = "analysis")] Analysis {
        record: AnalysisRecord,
    },
    #[serde(rename = "comparison")] Comparison {
        past_id: AnalysisId,
        current_id: AnalysisId,
        content: String,
    },
    #[serde(rename = "chat_reply")] ChatReply {
        message: ChatMessage,
    },
    #[serde(rename = "history")] History {
        entries: Vec<HistoryEntry>,
        current_id: Option<AnalysisId>,
        state: UploadState,
    },
    #[serde(rename = "patient")] Patient {
        patient_id: Option<String>,
    },
    #[serde(rename = "persistence")] Persistence {
        event: PersistenceEvent,
    },
    #[serde(rename = "warning")] Warning {
        message: String,
    },
    #[serde(rename = "error")] Error {
        message: String,
    },
}
