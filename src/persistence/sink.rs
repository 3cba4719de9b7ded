//! Where extraction batches go.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::core::error::PoolError;
use crate::core::types::{ExtractionRecord, UpsertOutcome};
use crate::persistence::pool::{ConnectionFactory, ResourcePool};
use crate::persistence::store::{Filter, StoreClient};

/// Operation tag for batch writes.
pub const UPSERT_TAG: &str = "upsert";
/// Operation tag for reads.
pub const SELECT_TAG: &str = "select";

#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn store(&self, records: &[ExtractionRecord]) -> Result<UpsertOutcome, PoolError>;
}

/// Row shape of the records table.
pub fn record_to_row(record: &ExtractionRecord) -> Value {
    json!({
        "post_url": record.key,
        "content": record.body,
        "list_id": record.source_list,
        "captured_at": record.observed_at.to_rfc3339(),
    })
}

/// Writes batches through the shared pool, with the pool's retry policy.
pub struct PooledRecordSink<F>
where
    F: ConnectionFactory,
    F::Connection: StoreClient,
{
    pool: ResourcePool<F>,
    table: String,
    conflict_key: String,
}

impl<F> PooledRecordSink<F>
where
    F: ConnectionFactory,
    F::Connection: StoreClient,
{
    pub fn new(pool: ResourcePool<F>, table: impl Into<String>, conflict_key: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
            conflict_key: conflict_key.into(),
        }
    }

    /// Most recent rows for `list_id`, read through the pool.
    pub async fn recent(&self, list_id: &str, limit: usize) -> Result<Vec<Value>, PoolError> {
        let table = self.table.as_str();
        let filters = [Filter::eq("list_id", list_id)];
        let filters = &filters;
        self.pool
            .with_connection(SELECT_TAG, |conn: Arc<F::Connection>| async move {
                conn.select(table, filters, limit).await
            })
            .await
    }
}

#[async_trait]
impl<F> RecordSink for PooledRecordSink<F>
where
    F: ConnectionFactory,
    F::Connection: StoreClient,
{
    async fn store(&self, records: &[ExtractionRecord]) -> Result<UpsertOutcome, PoolError> {
        if records.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        let rows: Vec<Value> = records.iter().map(record_to_row).collect();
        let rows = &rows;
        let table = self.table.as_str();
        let conflict_key = self.conflict_key.as_str();
        debug!("sink: writing {} row(s) to {}", rows.len(), table);
        self.pool
            .with_connection(UPSERT_TAG, |conn: Arc<F::Connection>| async move {
                conn.upsert(table, rows, conflict_key).await
            })
            .await
    }
}
