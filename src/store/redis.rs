use async_trait::async_trait;
use log::error;
use redis::{ AsyncCommands, Client };
use uuid::Uuid;

use super::{ newest_records, AnalysisStore, StoredAnalysis, StoredChat, ANALYSES_PATH, CHATS_PATH };
use crate::error::StoreError;
use crate::models::analysis::AnalysisRecord;

/// Analyses live in one hash keyed by id; insertion order is kept in a list,
/// per patient and overall. Chats are a list per analysis.
pub struct RedisStore {
    client: Client,
    key_prefix: String,
}

impl RedisStore {
    pub fn new(url: &str, key_prefix: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client: Client::open(url)?,
            key_prefix: key_prefix.to_string(),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn analyses_key(&self) -> String {
        format!("{}{}", self.key_prefix, ANALYSES_PATH)
    }

    fn order_key(&self, patient_id: Option<&str>) -> String {
        match patient_id {
            Some(p) => format!("{}{}:patient:{}", self.key_prefix, ANALYSES_PATH, p),
            None => format!("{}{}:order", self.key_prefix, ANALYSES_PATH),
        }
    }

    fn chats_key(&self, analysis_id: &str) -> String {
        format!("{}{}:{}", self.key_prefix, CHATS_PATH, analysis_id)
    }
}

#[async_trait]
impl AnalysisStore for RedisStore {
    async fn save_analysis(&self, analysis: &StoredAnalysis) -> Result<String, StoreError> {
        let mut conn = self.get_connection().await?;
        let id = Uuid::new_v4().to_string();
        let json = serde_json::to_string(analysis)?;

        let _: () = redis::pipe()
            .atomic()
            .hset(self.analyses_key(), &id, &json)
            .ignore()
            .rpush(self.order_key(None), &id)
            .ignore()
            .rpush(self.order_key(Some(&analysis.patient_id)), &id)
            .ignore()
            .query_async(&mut conn).await?;
        Ok(id)
    }

    async fn load_analyses(
        &self,
        patient_id: Option<&str>,
        limit: usize
    ) -> Result<Vec<AnalysisRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = conn.lrange(self.order_key(patient_id), -(limit as isize), -1).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis
            ::cmd("HMGET")
            .arg(self.analyses_key())
            .arg(&ids)
            .query_async(&mut conn).await?;

        let mut entries = Vec::new();
        for (id, value) in ids.into_iter().zip(values) {
            let Some(json) = value else {
                continue;
            };
            match serde_json::from_str::<StoredAnalysis>(&json) {
                Ok(stored) => entries.push((id, stored)),
                Err(e) => error!("Error parsing stored analysis {}: {}", id, e),
            }
        }
        Ok(newest_records(entries, limit))
    }

    async fn save_chat_message(&self, chat: &StoredChat) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(chat)?;
        let _: i64 = conn.rpush(self.chats_key(&chat.analysis_id), &json).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("redis (prefix '{}')", self.key_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed() {
        let store = RedisStore::new("redis://127.0.0.1:6379", "ecg:").unwrap();
        assert_eq!(store.analyses_key(), "ecg:ecg_analyses");
        assert_eq!(store.order_key(None), "ecg:ecg_analyses:order");
        assert_eq!(store.order_key(Some("P1")), "ecg:ecg_analyses:patient:P1");
        assert_eq!(store.chats_key("abc"), "ecg:ecg_chats:abc");
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(RedisStore::new("not a url", "ecg:").is_err());
    }
}
