//! Per-connection state: analysis history, the current analysis and the
//! chat transcript.
//!
//! A `Session` is owned by exactly one connection task and handed by `&mut`
//! to every workflow, so it needs no locking. The current analysis id always
//! refers to a record present in `history`.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{ Deserialize, Serialize };

use crate::models::analysis::{ AnalysisId, AnalysisRecord };
use crate::models::chat::ChatMessage;
use crate::models::websocket::{ HistoryEntry, RecordSelector };
use crate::upload::ImageUpload;

/// Whether a new analysis starts a fresh chat transcript.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatScope {
    Analysis,
    Session,
}

impl FromStr for ChatScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "analysis" => Ok(ChatScope::Analysis),
            "session" => Ok(ChatScope::Session),
            _ => Err(format!("Unsupported chat scope: {}", s)),
        }
    }
}

impl fmt::Display for ChatScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatScope::Analysis => write!(f, "analysis"),
            ChatScope::Session => write!(f, "session"),
        }
    }
}

/// Upload state machine: Idle → Uploaded → Analyzing → Analyzed | Failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Idle,
    Uploaded,
    Analyzing,
    Analyzed,
    Failed,
}

#[derive(Debug)]
pub struct Session {
    history: Vec<AnalysisRecord>,
    current: Option<AnalysisId>,
    transcript: Vec<ChatMessage>,
    patient_id: Option<String>,
    staged: Option<ImageUpload>,
    state: UploadState,
    chat_scope: ChatScope,
    unsaved_chats: Vec<ChatMessage>,
    failed_saves: HashSet<AnalysisId>,
}

impl Session {
    pub fn new(chat_scope: ChatScope) -> Self {
        Self {
            history: Vec::new(),
            current: None,
            transcript: Vec::new(),
            patient_id: None,
            staged: None,
            state: UploadState::Idle,
            chat_scope,
            unsaved_chats: Vec::new(),
            failed_saves: HashSet::new(),
        }
    }

    pub fn history(&self) -> &[AnalysisRecord] {
        &self.history
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn patient_id(&self) -> Option<&str> {
        self.patient_id.as_deref()
    }

    /// Blank ids clear the patient.
    pub fn set_patient_id(&mut self, patient_id: &str) {
        let trimmed = patient_id.trim();
        self.patient_id = if trimmed.is_empty() { None } else { Some(trimmed.to_string()) };
    }

    pub fn current(&self) -> Option<&AnalysisRecord> {
        self.current.and_then(|id| self.find(id))
    }

    pub fn find(&self, id: AnalysisId) -> Option<&AnalysisRecord> {
        self.history.iter().find(|r| r.id == id)
    }

    /// `position` is 1-indexed, as displayed.
    pub fn record_at_position(&self, position: usize) -> Option<&AnalysisRecord> {
        position.checked_sub(1).and_then(|idx| self.history.get(idx))
    }

    pub fn select(&self, selector: &RecordSelector) -> Option<&AnalysisRecord> {
        match selector {
            RecordSelector::Id { id } => self.find(*id),
            RecordSelector::Position { position } => self.record_at_position(*position),
        }
    }

    pub fn history_entries(&self) -> Vec<HistoryEntry> {
        self.history
            .iter()
            .enumerate()
            .map(|(idx, record)| {
                let position = idx + 1;
                HistoryEntry {
                    id: record.id,
                    position,
                    label: record.label(position),
                    timestamp: record.timestamp.clone(),
                    image_name: record.image_name.clone(),
                    report: record.report.clone(),
                }
            })
            .collect()
    }

    pub fn stage_upload(&mut self, upload: ImageUpload) {
        self.staged = Some(upload);
        self.state = UploadState::Uploaded;
    }

    pub fn staged_upload(&self) -> Option<&ImageUpload> {
        self.staged.as_ref()
    }

    /// Moves to `Analyzing` and hands back a copy of the staged image.
    pub fn begin_analysis(&mut self) -> Option<ImageUpload> {
        let upload = self.staged.clone()?;
        self.state = UploadState::Analyzing;
        Some(upload)
    }

    /// The staged image is kept so the user can retry.
    pub fn fail_analysis(&mut self) {
        self.state = UploadState::Failed;
    }

    /// Appends the record to history and makes it current.
    pub fn complete_analysis(&mut self, record: AnalysisRecord) -> &AnalysisRecord {
        if self.chat_scope == ChatScope::Analysis {
            self.transcript.clear();
        }
        self.current = Some(record.id);
        self.state = UploadState::Analyzed;
        self.history.push(record);
        &self.history[self.history.len() - 1]
    }

    pub fn attach_persisted_id(&mut self, id: AnalysisId, store_id: &str) -> bool {
        match self.history.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.persisted_id = Some(store_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Replaces history with records loaded from the store. The current
    /// record survives: it is re-pointed to the loaded copy sharing its store
    /// id, or appended when none does.
    pub fn replace_history(&mut self, loaded: Vec<AnalysisRecord>) {
        let current = self.current().cloned();
        self.history = loaded;

        let Some(current) = current else {
            self.current = None;
            return;
        };

        let matching = current.persisted_id.as_ref().and_then(|store_id| {
            self.history
                .iter()
                .find(|r| r.persisted_id.as_ref() == Some(store_id))
                .map(|r| r.id)
        });

        match matching {
            Some(id) => {
                if id != current.id {
                    for message in self.transcript.iter_mut() {
                        if message.analysis_id == current.id {
                            message.analysis_id = id;
                        }
                    }
                }
                self.current = Some(id);
            }
            None => {
                self.current = Some(current.id);
                self.history.push(current);
            }
        }
    }

    /// Holds a chat message until its analysis has a store id.
    pub fn defer_chat(&mut self, message: ChatMessage) {
        self.unsaved_chats.push(message);
    }

    /// Removes and returns the held messages of one analysis, oldest first.
    pub fn take_unsaved_chats(&mut self, analysis_id: AnalysisId) -> Vec<ChatMessage> {
        let (taken, kept) = std::mem::take(&mut self.unsaved_chats)
            .into_iter()
            .partition(|m| m.analysis_id == analysis_id);
        self.unsaved_chats = kept;
        taken
    }

    pub fn mark_save_failed(&mut self, analysis_id: AnalysisId) {
        self.failed_saves.insert(analysis_id);
    }

    pub fn save_failed(&self, analysis_id: AnalysisId) -> bool {
        self.failed_saves.contains(&analysis_id)
    }

    pub fn push_message(&mut self, message: ChatMessage) {
        self.transcript.push(message);
    }

    /// The last `limit` messages of the transcript.
    pub fn recent_messages(&self, limit: usize) -> &[ChatMessage] {
        let start = self.transcript.len().saturating_sub(limit);
        &self.transcript[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::{ sample_png, ImageUpload };

    fn record(name: &str) -> AnalysisRecord {
        AnalysisRecord::new(name, format!("report for {}", name), None)
    }

    fn upload(name: &str) -> ImageUpload {
        ImageUpload::new(name, None, sample_png(), 1024).unwrap()
    }

    #[test]
    fn upload_state_machine() {
        let mut session = Session::new(ChatScope::Analysis);
        assert_eq!(session.state(), UploadState::Idle);
        assert!(session.begin_analysis().is_none());

        session.stage_upload(upload("a.png"));
        assert_eq!(session.state(), UploadState::Uploaded);

        let staged = session.begin_analysis().unwrap();
        assert_eq!(staged.file_name, "a.png");
        assert_eq!(session.state(), UploadState::Analyzing);

        session.fail_analysis();
        assert_eq!(session.state(), UploadState::Failed);
        assert!(session.staged_upload().is_some());
        assert!(session.history().is_empty());

        session.begin_analysis().unwrap();
        session.complete_analysis(record("a.png"));
        assert_eq!(session.state(), UploadState::Analyzed);
    }

    #[test]
    fn two_analyses_then_select_first_position() {
        let mut session = Session::new(ChatScope::Analysis);
        let a = session.complete_analysis(record("a.png")).id;
        assert_eq!(session.history().len(), 1);

        let b = session.complete_analysis(record("b.png")).id;
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.current().unwrap().id, b);

        assert_eq!(session.record_at_position(1).unwrap().id, a);
        assert_eq!(session.record_at_position(2).unwrap().id, b);
        assert!(session.record_at_position(0).is_none());
        assert!(session.record_at_position(3).is_none());
    }

    #[test]
    fn history_entries_are_one_indexed() {
        let mut session = Session::new(ChatScope::Analysis);
        session.complete_analysis(record("a.png"));
        session.complete_analysis(record("b.png"));

        for (k, entry) in session.history_entries().iter().enumerate() {
            assert_eq!(entry.position, k + 1);
            assert!(entry.label.starts_with(&format!("{}: ", k + 1)));
            let by_id = session.select(&RecordSelector::Id { id: entry.id }).unwrap();
            let by_pos = session.select(&RecordSelector::Position { position: entry.position }).unwrap();
            assert_eq!(by_id.id, by_pos.id);
            assert_eq!(by_id.id, session.history()[k].id);
        }
    }

    #[test]
    fn analysis_scope_resets_transcript() {
        let mut session = Session::new(ChatScope::Analysis);
        let a = session.complete_analysis(record("a.png")).id;
        session.push_message(ChatMessage::user("hi", a));
        session.complete_analysis(record("b.png"));
        assert!(session.transcript().is_empty());
    }

    #[test]
    fn session_scope_keeps_transcript() {
        let mut session = Session::new(ChatScope::Session);
        let a = session.complete_analysis(record("a.png")).id;
        session.push_message(ChatMessage::user("hi", a));
        session.complete_analysis(record("b.png"));
        assert_eq!(session.transcript().len(), 1);
    }

    #[test]
    fn recent_messages_is_a_sliding_window() {
        let mut session = Session::new(ChatScope::Analysis);
        let a = session.complete_analysis(record("a.png")).id;
        for i in 0..5 {
            session.push_message(ChatMessage::user(&format!("q{}", i), a));
        }
        let window = session.recent_messages(2);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].content, "q3");
        assert_eq!(session.recent_messages(50).len(), 5);
    }

    #[test]
    fn replace_history_keeps_unsaved_current() {
        let mut session = Session::new(ChatScope::Analysis);
        let current = session.complete_analysis(record("local.png")).id;

        let mut stored = record("old.png");
        stored.persisted_id = Some("-Nx1".into());
        session.replace_history(vec![stored]);

        assert_eq!(session.history().len(), 2);
        assert_eq!(session.current().unwrap().id, current);
        assert_eq!(session.history()[1].id, current);
    }

    #[test]
    fn replace_history_repoints_current_to_loaded_copy() {
        let mut session = Session::new(ChatScope::Analysis);
        let current = session.complete_analysis(record("a.png")).id;
        assert!(session.attach_persisted_id(current, "-Nx1"));
        session.push_message(ChatMessage::user("hi", current));

        let mut stored = record("a.png");
        stored.persisted_id = Some("-Nx1".into());
        let stored_id = stored.id;
        session.replace_history(vec![record("older.png"), stored]);

        assert_eq!(session.history().len(), 2);
        assert_eq!(session.current().unwrap().id, stored_id);
        assert_eq!(session.transcript()[0].analysis_id, stored_id);
    }

    #[test]
    fn replace_history_without_current() {
        let mut session = Session::new(ChatScope::Analysis);
        session.replace_history(vec![record("a.png"), record("b.png")]);
        assert_eq!(session.history().len(), 2);
        assert!(session.current().is_none());
    }

    #[test]
    fn held_chats_are_taken_per_analysis_in_order() {
        let mut session = Session::new(ChatScope::Session);
        let a = session.complete_analysis(record("a.png")).id;
        let b = session.complete_analysis(record("b.png")).id;
        session.defer_chat(ChatMessage::user("q-a", a));
        session.defer_chat(ChatMessage::user("q-b", b));
        session.defer_chat(ChatMessage::assistant("r-a", a));

        let taken: Vec<String> = session.take_unsaved_chats(a).into_iter().map(|m| m.content).collect();
        assert_eq!(taken, vec!["q-a", "r-a"]);
        assert!(session.take_unsaved_chats(a).is_empty());
        assert_eq!(session.take_unsaved_chats(b).len(), 1);
    }

    #[test]
    fn patient_id_blank_clears() {
        let mut session = Session::new(ChatScope::Analysis);
        session.set_patient_id(" P-42 ");
        assert_eq!(session.patient_id(), Some("P-42"));
        session.set_patient_id("");
        assert!(session.patient_id().is_none());
    }

    #[test]
    fn chat_scope_parses() {
        assert_eq!("analysis".parse::<ChatScope>().unwrap(), ChatScope::Analysis);
        assert_eq!("Session".parse::<ChatScope>().unwrap(), ChatScope::Session);
        assert!("global".parse::<ChatScope>().is_err());
    }
}
