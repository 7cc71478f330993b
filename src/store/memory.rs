use async_trait::async_trait;
use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };
use tokio::sync::RwLock;

use super::{ newest_records, AnalysisStore, StoredAnalysis, StoredChat };
use crate::error::StoreError;
use crate::models::analysis::AnalysisRecord;

/// Process-local store. Shared by all sessions of one server process.
#[derive(Default)]
pub struct MemoryStore {
    analyses: RwLock<Vec<(String, StoredAnalysis)>>,
    chats: RwLock<Vec<StoredChat>>,
    next_key: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Makes every call fail, as an unreachable backend would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn chats(&self) -> Vec<StoredChat> {
        self.chats.read().await.clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError("memory store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AnalysisStore for MemoryStore {
    async fn save_analysis(&self, analysis: &StoredAnalysis) -> Result<String, StoreError> {
        self.check()?;
        let key = format!("mem-{:06}", self.next_key.fetch_add(1, Ordering::SeqCst));
        self.analyses.write().await.push((key.clone(), analysis.clone()));
        Ok(key)
    }

    async fn load_analyses(
        &self,
        patient_id: Option<&str>,
        limit: usize
    ) -> Result<Vec<AnalysisRecord>, StoreError> {
        self.check()?;
        let entries = self.analyses
            .read().await
            .iter()
            .filter(|(_, a)| patient_id.map_or(true, |p| a.patient_id == p))
            .cloned()
            .collect();
        Ok(newest_records(entries, limit))
    }

    async fn save_chat_message(&self, chat: &StoredChat) -> Result<(), StoreError> {
        self.check()?;
        self.chats.write().await.push(chat.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
