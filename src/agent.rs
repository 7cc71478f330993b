use crate::cli::Args;
use crate::config::prompt::{ self, PromptConfig, PromptError };
use crate::error::{ StoreError, WorkflowError };
use crate::llm::{ new_client, InferenceClient, LlmConfig };
use crate::models::analysis::{ AnalysisId, AnalysisRecord };
use crate::models::chat::ChatMessage;
use crate::models::websocket::{ PersistenceEvent, RecordSelector };
use crate::session::{ ChatScope, Session };
use crate::store::{ initialize_store, AnalysisStore, StoredAnalysis, StoredChat };
use crate::upload::ImageUpload;

use log::{ info, warn, error, debug };
use std::error::Error;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock as TokioRwLock;

pub type PersistenceSender = UnboundedSender<PersistenceEvent>;

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub history_load_limit: usize,
    pub thumbnail_chars: usize,
    pub chat_context_messages: usize,
    pub chat_scope: ChatScope,
    pub max_upload_bytes: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            history_load_limit: 10,
            thumbnail_chars: 1000,
            chat_context_messages: 20,
            chat_scope: ChatScope::Analysis,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

impl WorkflowSettings {
    pub fn from_args(args: &Args) -> Result<Self, String> {
        Ok(Self {
            history_load_limit: args.history_load_limit,
            thumbnail_chars: args.thumbnail_chars,
            chat_context_messages: args.chat_context_messages,
            chat_scope: args.chat_scope.parse()?,
            max_upload_bytes: args.max_upload_bytes,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub past_id: AnalysisId,
    pub current_id: AnalysisId,
    pub content: String,
}

/// Runs the analysis, comparison and chat workflows against a caller-owned
/// `Session`. Shared by every connection.
#[derive(Clone)]
pub struct EcgAgent {
    inference: Arc<dyn InferenceClient>,
    store: Option<Arc<dyn AnalysisStore>>,
    prompt_config: Arc<TokioRwLock<Arc<PromptConfig>>>,
    settings: WorkflowSettings,
}

impl EcgAgent {
    pub async fn new(args: &Args) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let llm_config = LlmConfig {
            api_key: args.gemini_api_key.clone(),
            model: args.gemini_model.clone(),
            base_url: args.gemini_base_url.clone(),
        };
        let inference = new_client(&llm_config)?;
        info!(
            "Inference client configured: Model={}, BaseURL={}",
            llm_config.model,
            llm_config.base_url
        );

        let store = initialize_store(args).await?;
        let prompts = prompt::initialize_prompts(args.prompts_path.as_deref())?;
        let settings = WorkflowSettings::from_args(args)?;

        Ok(Self::with_parts(inference, store, prompts, settings))
    }

    pub fn with_parts(
        inference: Arc<dyn InferenceClient>,
        store: Option<Arc<dyn AnalysisStore>>,
        prompts: Arc<PromptConfig>,
        settings: WorkflowSettings
    ) -> Self {
        Self {
            inference,
            store,
            prompt_config: Arc::new(TokioRwLock::new(prompts)),
            settings,
        }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub fn model(&self) -> String {
        self.inference.get_model()
    }

    pub fn store_description(&self) -> Option<String> {
        self.store.as_ref().map(|s| s.describe())
    }

    pub fn new_session(&self) -> Session {
        Session::new(self.settings.chat_scope)
    }

    async fn prompts(&self) -> Arc<PromptConfig> {
        Arc::clone(&*self.prompt_config.read().await)
    }

    /// Validates the image and stages it. `Idle → Uploaded`.
    pub fn upload<'s>(
        &self,
        session: &'s mut Session,
        file_name: &str,
        mime_type: Option<&str>,
        data: &str
    ) -> Result<&'s ImageUpload, WorkflowError> {
        let upload = ImageUpload::from_base64(
            file_name,
            mime_type,
            data,
            self.settings.max_upload_bytes
        )?;
        info!("Staged upload '{}' ({}, {} bytes)", upload.file_name, upload.mime_type, upload.size());
        session.stage_upload(upload);
        session.staged_upload().ok_or(WorkflowError::NoUpload)
    }

    /// `Uploaded → Analyzing → Analyzed | Failed`. On success the record is
    /// current and persistence is started in the background.
    pub async fn analyze(
        &self,
        session: &mut Session,
        events: &PersistenceSender
    ) -> Result<AnalysisRecord, WorkflowError> {
        let upload = session.begin_analysis().ok_or(WorkflowError::NoUpload)?;
        let prompts = self.prompts().await;
        info!("Analyzing '{}'", upload.file_name);

        let report = match
            self.inference.interpret_image(prompt::get_analysis_instruction(&prompts), &upload).await
        {
            Ok(report) => report,
            Err(e) => {
                error!("Analysis of '{}' failed: {}", upload.file_name, e);
                session.fail_analysis();
                return Err(e.into());
            }
        };

        let record = AnalysisRecord::new(
            &upload.file_name,
            report,
            session.patient_id().map(str::to_string)
        );
        let record = session.complete_analysis(record).clone();
        info!("Analysis {} complete, history size {}", record.id, session.history().len());

        self.persist_analysis(&record, &upload, events);
        Ok(record)
    }

    fn persist_analysis(&self, record: &AnalysisRecord, upload: &ImageUpload, events: &PersistenceSender) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let analysis_id = record.id;
        let stored = StoredAnalysis::from_record(record, upload, self.settings.thumbnail_chars);
        let events = events.clone();

        tokio::spawn(async move {
            let event = match store.save_analysis(&stored).await {
                Ok(store_id) => {
                    info!("Analysis {} saved with ID: {}", analysis_id, store_id);
                    PersistenceEvent::AnalysisSaved { analysis_id, store_id }
                }
                Err(e) => {
                    warn!("Failed to save analysis {}: {}", analysis_id, e);
                    PersistenceEvent::AnalysisFailed { analysis_id, message: e.to_string() }
                }
            };
            if events.send(event).is_err() {
                debug!("Session closed before persistence of {} finished", analysis_id);
            }
        });
    }

    /// Saves a chat message under its analysis' store id. While that analysis
    /// is still being saved the message is held in the session and written
    /// once the save is reported.
    fn persist_chat(&self, session: &mut Session, message: &ChatMessage, events: &PersistenceSender) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let analysis_id = message.analysis_id;
        if session.save_failed(analysis_id) {
            report_chat_failure(events, analysis_id, 1, "analysis was not saved");
            return;
        }
        match session.find(analysis_id).and_then(|r| r.persisted_id.clone()) {
            Some(store_id) => {
                let chats = vec![StoredChat::from_message(message, &store_id)];
                spawn_chat_saves(store, chats, analysis_id, events.clone());
            }
            None => {
                debug!("Analysis {} has no store ID yet, holding chat message", analysis_id);
                session.defer_chat(message.clone());
            }
        }
    }

    /// Applies a background save outcome to the session. Chat messages held
    /// for the analysis are written on success and reported failed otherwise.
    pub fn apply_persistence_event(
        &self,
        session: &mut Session,
        event: &PersistenceEvent,
        events: &PersistenceSender
    ) {
        match event {
            PersistenceEvent::AnalysisSaved { analysis_id, store_id } => {
                let held = session.take_unsaved_chats(*analysis_id);
                if !session.attach_persisted_id(*analysis_id, store_id) {
                    debug!("Saved analysis {} is no longer in the session", analysis_id);
                }
                if held.is_empty() {
                    return;
                }
                let Some(store) = self.store.clone() else {
                    return;
                };
                info!("Writing {} held chat messages for analysis {}", held.len(), analysis_id);
                let chats = held
                    .iter()
                    .map(|m| StoredChat::from_message(m, store_id))
                    .collect();
                spawn_chat_saves(store, chats, *analysis_id, events.clone());
            }
            PersistenceEvent::AnalysisFailed { analysis_id, .. } => {
                session.mark_save_failed(*analysis_id);
                let held = session.take_unsaved_chats(*analysis_id);
                if !held.is_empty() {
                    report_chat_failure(events, *analysis_id, held.len(), "analysis was not saved");
                }
            }
            PersistenceEvent::ChatFailed { .. } => {}
        }
    }

    /// Compares a past analysis with the current one. Requires a non-empty
    /// history and a current analysis; no remote call otherwise.
    pub async fn compare(
        &self,
        session: &Session,
        selector: &RecordSelector
    ) -> Result<Comparison, WorkflowError> {
        if session.history().is_empty() {
            return Err(WorkflowError::EmptyHistory);
        }
        let current = session.current().ok_or(WorkflowError::NoCurrentAnalysis)?;
        let past = session.select(selector).ok_or_else(|| {
            WorkflowError::UnknownRecord(match selector {
                RecordSelector::Id { id } => id.to_string(),
                RecordSelector::Position { position } => position.to_string(),
            })
        })?;

        let prompts = self.prompts().await;
        let comparison_prompt = prompt::get_comparison_prompt(&prompts, past, current);
        info!("Comparing analysis {} with current {}", past.id, current.id);

        let content = self.inference.generate_text(&comparison_prompt).await.map_err(|e| {
            error!("Comparison failed: {}", e);
            e
        })?;

        Ok(Comparison {
            past_id: past.id,
            current_id: current.id,
            content,
        })
    }

    /// Appends the question, asks the model and appends the reply. A failed
    /// call leaves the question in the transcript without a reply.
    pub async fn chat(
        &self,
        session: &mut Session,
        question: &str,
        events: &PersistenceSender
    ) -> Result<ChatMessage, WorkflowError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(WorkflowError::EmptyMessage);
        }
        let current = session.current().cloned().ok_or(WorkflowError::NoCurrentAnalysis)?;

        let context = session.recent_messages(self.settings.chat_context_messages).to_vec();
        let user_message = ChatMessage::user(question, current.id);
        session.push_message(user_message.clone());
        self.persist_chat(session, &user_message, events);

        let prompts = self.prompts().await;
        let chat_prompt = prompt::get_chat_prompt(&prompts, &current.report, &context, question);

        let reply = self.inference.generate_text(&chat_prompt).await.map_err(|e| {
            error!("Chat reply failed: {}", e);
            e
        })?;

        let assistant_message = ChatMessage::assistant(&reply, current.id);
        session.push_message(assistant_message.clone());
        self.persist_chat(session, &assistant_message, events);
        Ok(assistant_message)
    }

    /// Replaces the session history with stored analyses, filtered by the
    /// session patient when one is set. An empty result leaves history alone.
    pub async fn load_history(&self, session: &mut Session) -> Result<usize, WorkflowError> {
        let loaded = self.list_analyses(session.patient_id()).await?;
        let count = loaded.len();
        if count == 0 {
            info!("No stored analyses found");
            return Ok(0);
        }
        session.replace_history(loaded);
        info!("Loaded {} analyses into session", count);
        Ok(count)
    }

    pub async fn list_analyses(
        &self,
        patient_id: Option<&str>
    ) -> Result<Vec<AnalysisRecord>, WorkflowError> {
        let store = self.store.as_ref().ok_or(WorkflowError::StoreUnavailable)?;
        let loaded = store
            .load_analyses(patient_id, self.settings.history_load_limit).await
            .map_err(|e: StoreError| {
                error!("Failed to load analyses: {}", e);
                e
            })?;
        Ok(loaded)
    }

    pub async fn reload_prompts_if_changed(&self, path: &str) -> Result<bool, PromptError> {
        let current = self.prompts().await;
        match prompt::reload_prompts_if_changed(path, &current)? {
            Some(new_config) => {
                *self.prompt_config.write().await = new_config;
                info!("Prompts successfully reloaded");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Writes chat messages one after another so the stored order matches the
/// transcript.
fn spawn_chat_saves(
    store: Arc<dyn AnalysisStore>,
    chats: Vec<StoredChat>,
    analysis_id: AnalysisId,
    events: PersistenceSender
) {
    tokio::spawn(async move {
        let total = chats.len();
        let mut failed = 0;
        let mut last_error = String::new();
        for chat in &chats {
            if let Err(e) = store.save_chat_message(chat).await {
                warn!("Failed to save chat message: {}", e);
                failed += 1;
                last_error = e.to_string();
            }
        }
        if failed > 0 {
            debug!("{} of {} chat messages for {} not saved", failed, total, analysis_id);
            report_chat_failure(&events, analysis_id, failed, &last_error);
        }
    });
}

fn report_chat_failure(events: &PersistenceSender, analysis_id: AnalysisId, count: usize, reason: &str) {
    let event = PersistenceEvent::ChatFailed {
        analysis_id,
        message: format!("{} chat message(s) not saved: {}", count, reason),
    };
    if events.send(event).is_err() {
        debug!("Session closed before chat failure for {} was reported", analysis_id);
    }
}
