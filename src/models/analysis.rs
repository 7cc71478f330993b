use chrono::Local;
use serde::{ Deserialize, Serialize };
use std::fmt;
use uuid::Uuid;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn timestamp_now() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Opaque handle for a record within a session. The browser gets it back
/// with every listing and sends it unchanged when selecting a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisId(Uuid);

impl AnalysisId {
    pub fn new() -> Self {
        AnalysisId(Uuid::new_v4())
    }
}

impl Default for AnalysisId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AnalysisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: AnalysisId,
    pub timestamp: String,
    pub image_name: String,
    pub report: String,
    /// Key assigned by the persistence backend once the record is saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persisted_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
}

impl AnalysisRecord {
    pub fn new(image_name: &str, report: String, patient_id: Option<String>) -> Self {
        Self {
            id: AnalysisId::new(),
            timestamp: timestamp_now(),
            image_name: image_name.to_string(),
            report,
            persisted_id: None,
            patient_id,
        }
    }

    /// Display label used by the comparison selector, e.g. `2: 2024-01-01 10:00:00 - b.png`.
    pub fn label(&self, position: usize) -> String {
        format!("{}: {} - {}", position, self.timestamp, self.image_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_travel_as_plain_uuid_strings() {
        let id = AnalysisId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        assert_eq!(serde_json::from_str::<AnalysisId>(&json).unwrap(), id);
        assert!(serde_json::from_str::<AnalysisId>("\"not-a-uuid\"").is_err());
    }

    #[test]
    fn new_record_has_formatted_timestamp() {
        let record = AnalysisRecord::new("a.png", "Sinus rhythm".into(), None);
        assert!(chrono::NaiveDateTime::parse_from_str(&record.timestamp, TIMESTAMP_FORMAT).is_ok());
        assert!(record.persisted_id.is_none());
    }

    #[test]
    fn label_uses_display_position() {
        let mut record = AnalysisRecord::new("b.png", String::new(), None);
        record.timestamp = "2024-01-01 10:00:00".into();
        assert_eq!(record.label(2), "2: 2024-01-01 10:00:00 - b.png");
    }

    #[test]
    fn optional_fields_are_omitted_when_empty() {
        let record = AnalysisRecord::new("a.png", "r".into(), None);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("persisted_id").is_none());
        assert!(json.get("patient_id").is_none());
    }
}
