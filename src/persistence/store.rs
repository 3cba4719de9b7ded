//! Backing data store client.
//!
//! `StoreClient` is the narrow interface the rest of the crate writes and
//! reads through. `RestStore` speaks the PostgREST dialect used by hosted
//! Postgres services: `POST /rest/v1/{table}?on_conflict=..` for upserts with
//! duplicates ignored, and `GET /rest/v1/{table}?col=eq.val&limit=N` for
//! reads.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::core::config::StoreSettings;
use crate::core::error::{PoolError, StoreError};
use crate::core::types::UpsertOutcome;
use crate::persistence::pool::ConnectionFactory;

/// One `column = value` equality filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub value: String,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Insert `records`; rows colliding on `conflict_key` are skipped, not errors.
    async fn upsert(
        &self,
        table: &str,
        records: &[Value],
        conflict_key: &str,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn select(
        &self,
        table: &str,
        filters: &[Filter],
        limit: usize,
    ) -> Result<Vec<Value>, StoreError>;
}

#[derive(Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for RestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestStore")
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .finish()
    }
}

impl RestStore {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn from_settings(settings: &StoreSettings) -> Result<Self, StoreError> {
        let url = settings
            .resolve_url()
            .ok_or_else(|| StoreError::NotConfigured("store URL is not set".to_string()))?;
        let key = settings
            .resolve_api_key()
            .ok_or_else(|| StoreError::NotConfigured("store API key is not set".to_string()))?;
        Self::new(url, key, Duration::from_secs(settings.request_timeout_secs))
    }

    fn table_url(&self, table: &str) -> Result<url::Url, StoreError> {
        url::Url::parse(&format!("{}/rest/v1/{}", self.base_url, table))
            .map_err(|e| StoreError::NotConfigured(format!("invalid store URL: {}", e)))
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }
}

async fn rejected(resp: reqwest::Response) -> StoreError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    StoreError::Rejected {
        status,
        body: body.chars().take(500).collect(),
    }
}

#[async_trait]
impl StoreClient for RestStore {
    async fn upsert(
        &self,
        table: &str,
        records: &[Value],
        conflict_key: &str,
    ) -> Result<UpsertOutcome, StoreError> {
        if records.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        let mut url = self.table_url(table)?;
        url.query_pairs_mut().append_pair("on_conflict", conflict_key);

        let resp = self
            .authorized(self.client.post(url))
            .header("Prefer", "resolution=ignore-duplicates,return=representation")
            .json(records)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 409 {
            // Whole batch collided on the natural key.
            debug!("store: upsert into {} conflicted entirely", table);
            return Ok(UpsertOutcome {
                inserted: 0,
                skipped: records.len(),
            });
        }
        if !status.is_success() {
            return Err(rejected(resp).await);
        }

        let text = resp
            .text()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let inserted = if text.trim().is_empty() {
            0
        } else {
            serde_json::from_str::<Vec<Value>>(&text)
                .map_err(|e| StoreError::Decode(e.to_string()))?
                .len()
        }
        .min(records.len());

        Ok(UpsertOutcome {
            inserted,
            skipped: records.len() - inserted,
        })
    }

    async fn select(
        &self,
        table: &str,
        filters: &[Filter],
        limit: usize,
    ) -> Result<Vec<Value>, StoreError> {
        let mut url = self.table_url(table)?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("select", "*");
            for f in filters {
                q.append_pair(&f.column, &format!("eq.{}", f.value));
            }
            q.append_pair("limit", &limit.to_string());
        }

        let resp = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(rejected(resp).await);
        }
        resp.json::<Vec<Value>>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }
}

/// Opens one `RestStore` handle per pool entry.
#[derive(Debug, Clone)]
pub struct RestStoreFactory {
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl RestStoreFactory {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &StoreSettings) -> Result<Self, StoreError> {
        let base_url = settings
            .resolve_url()
            .ok_or_else(|| StoreError::NotConfigured("store URL is not set".to_string()))?;
        let api_key = settings
            .resolve_api_key()
            .ok_or_else(|| StoreError::NotConfigured("store API key is not set".to_string()))?;
        Ok(Self::new(
            base_url,
            api_key,
            Duration::from_secs(settings.request_timeout_secs),
        ))
    }
}

#[async_trait]
impl ConnectionFactory for RestStoreFactory {
    type Connection = RestStore;

    async fn connect(&self, tag: &str) -> Result<RestStore, PoolError> {
        debug!("store: opening client for '{}'", tag);
        RestStore::new(self.base_url.clone(), self.api_key.clone(), self.timeout)
            .map_err(|e| PoolError::Connect(e.to_string()))
    }
}
