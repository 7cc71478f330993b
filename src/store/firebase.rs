use async_trait::async_trait;
use log::{ info, warn };
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use yup_oauth2::authenticator::DefaultAuthenticator;
use yup_oauth2::{ read_service_account_key, ServiceAccountAuthenticator, ServiceAccountKey };

use super::{ newest_records, AnalysisStore, StoredAnalysis, StoredChat, ANALYSES_PATH, CHATS_PATH };
use crate::error::StoreError;
use crate::models::analysis::AnalysisRecord;

const DATABASE_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/firebase.database",
    "https://www.googleapis.com/auth/userinfo.email",
];

#[derive(Deserialize)]
struct PushResponse {
    name: String,
}

/// Firebase Realtime Database over its REST API.
///
/// With a service account, one authenticator lives for the whole store and
/// hands out its cached token until it needs refreshing.
pub struct FirebaseStore {
    client: reqwest::Client,
    database_url: String,
    auth: Option<DefaultAuthenticator>,
}

impl FirebaseStore {
    pub fn new(database_url: &str, auth: Option<DefaultAuthenticator>) -> Self {
        Self {
            client: reqwest::Client::new(),
            database_url: database_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    pub async fn with_service_account(
        database_url: &str,
        key: ServiceAccountKey
    ) -> Result<Self, StoreError> {
        let auth = ServiceAccountAuthenticator::builder(key)
            .build().await
            .map_err(|e| StoreError(format!("Failed to build authenticator: {}", e)))?;
        Ok(Self::new(database_url, Some(auth)))
    }

    /// Uses the service account when its key file can be read, anonymous
    /// access (public database rules) otherwise.
    pub async fn connect(database_url: &str, sa_key_path: Option<&str>) -> Result<Self, StoreError> {
        if database_url.trim().is_empty() {
            return Err(StoreError("FIREBASE_DATABASE_URL is required for the firebase store".to_string()));
        }

        let Some(path) = sa_key_path else {
            info!("No Firebase service account configured. Using anonymous access.");
            return Ok(Self::new(database_url, None));
        };

        match read_service_account_key(Path::new(path)).await {
            Ok(key) => {
                info!("Firebase service account loaded from {}", path);
                Self::with_service_account(database_url, key).await
            }
            Err(e) => {
                warn!("Failed to load service account key from {}: {}. Using anonymous access.", path, e);
                Ok(Self::new(database_url, None))
            }
        }
    }

    async fn access_token(&self) -> Result<Option<String>, StoreError> {
        let Some(auth) = &self.auth else {
            return Ok(None);
        };
        let token = auth.token(DATABASE_SCOPES).await.map_err(|e| StoreError(e.to_string()))?;
        token
            .token()
            .map(|t| Some(t.to_string()))
            .ok_or_else(|| StoreError("OAuth token was None".to_string()))
    }

    async fn request(
        &self,
        method: reqwest::Method,
        node: &str,
        query: &[(&str, String)]
    ) -> Result<reqwest::RequestBuilder, StoreError> {
        let url = format!("{}/{}.json", self.database_url, node);
        let mut req = self.client.request(method, &url).query(query);
        if let Some(token) = self.access_token().await? {
            req = req.query(&[("access_token", token)]);
        }
        Ok(req)
    }

    async fn push<T: serde::Serialize + Sync>(&self, node: &str, value: &T) -> Result<String, StoreError> {
        let resp = self.request(reqwest::Method::POST, node, &[]).await?.json(value).send().await?;
        let resp = resp.error_for_status()?;
        let pushed: PushResponse = resp.json().await?;
        Ok(pushed.name)
    }
}

#[async_trait]
impl AnalysisStore for FirebaseStore {
    async fn save_analysis(&self, analysis: &StoredAnalysis) -> Result<String, StoreError> {
        self.push(ANALYSES_PATH, analysis).await
    }

    async fn load_analyses(
        &self,
        patient_id: Option<&str>,
        limit: usize
    ) -> Result<Vec<AnalysisRecord>, StoreError> {
        // Query parameters are JSON values, so string arguments keep their quotes.
        let query = match patient_id {
            Some(p) =>
                vec![
                    ("orderBy", "\"patient_id\"".to_string()),
                    ("equalTo", serde_json::to_string(p)?)
                ],
            None =>
                vec![
                    ("orderBy", "\"timestamp\"".to_string()),
                    ("limitToLast", limit.to_string())
                ],
        };

        let resp = self.request(reqwest::Method::GET, ANALYSES_PATH, &query).await?.send().await?;
        let resp = resp.error_for_status()?;
        let body: Option<HashMap<String, serde_json::Value>> = resp.json().await?;

        let mut entries = Vec::new();
        for (key, value) in body.unwrap_or_default() {
            match serde_json::from_value::<StoredAnalysis>(value) {
                Ok(stored) => entries.push((key, stored)),
                Err(e) => warn!("Skipping malformed analysis '{}': {}", key, e),
            }
        }
        Ok(newest_records(entries, limit))
    }

    async fn save_chat_message(&self, chat: &StoredChat) -> Result<(), StoreError> {
        self.push(CHATS_PATH, chat).await.map(|_| ())
    }

    fn describe(&self) -> String {
        let auth = if self.auth.is_some() { "service account" } else { "anonymous" };
        format!("firebase at {} ({})", self.database_url, auth)
    }
}
