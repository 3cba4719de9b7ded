//! Scroll-and-extract loop.
//!
//! Each iteration expands truncated items, reads every rendered item, keeps
//! the ones with a key and a body that have not been seen this session, and
//! queues them for a batched write. Iterations that add nothing advance the
//! stall counter; reaching `stall_limit` is treated as end of feed. Between
//! iterations the page is scrolled by a random amount and the loop sleeps a
//! random delay.
//!
//! A batch that still fails after the pool's retries is logged and dropped.
//! Its keys stay in the dedup index so the items are not collected again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::distr::{Distribution, Uniform};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::ExtractionSettings;
use crate::core::error::{DriverError, ExtractionError};
use crate::core::types::{ActionOutcome, ExtractionRecord, ExtractionSummary, RawFeedItem, Termination};
use crate::persistence::sink::RecordSink;
use crate::scraping::driver::PageHandle;
use crate::scraping::feed_profile::{scroll_script, FeedProfile};

/// Natural keys seen during one session.
#[derive(Debug, Default)]
pub struct DedupIndex {
    keys: HashSet<String>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key`; `false` if it was already present.
    pub fn insert(&mut self, key: &str) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        self.keys.insert(key.to_string())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Records waiting for the next flush.
#[derive(Debug)]
pub struct PendingBatch {
    records: Vec<ExtractionRecord>,
    threshold: usize,
}

impl PendingBatch {
    pub fn new(threshold: usize) -> Self {
        Self {
            records: Vec::with_capacity(threshold),
            threshold: threshold.max(1),
        }
    }

    pub fn push(&mut self, record: ExtractionRecord) {
        self.records.push(record);
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.threshold
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Up to `threshold` records from the front, in arrival order.
    pub fn take_batch(&mut self) -> Vec<ExtractionRecord> {
        let n = self.records.len().min(self.threshold);
        self.records.drain(..n).collect()
    }
}

/// Everything one run produced.
#[derive(Debug)]
pub struct ExtractionRun {
    /// Unique records in first-seen order.
    pub records: Vec<ExtractionRecord>,
    pub summary: ExtractionSummary,
}

fn page_error(e: DriverError) -> ExtractionError {
    if e.is_closed() {
        ExtractionError::PageClosed
    } else {
        ExtractionError::Page(e)
    }
}

pub struct ExtractionLoop {
    settings: ExtractionSettings,
    profile: FeedProfile,
    sink: Arc<dyn RecordSink>,
    cancel: CancellationToken,
}

impl ExtractionLoop {
    pub fn new(settings: ExtractionSettings, profile: FeedProfile, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            settings,
            profile,
            sink,
            cancel: CancellationToken::new(),
        }
    }

    /// Checked at the top of every iteration.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Click "see more" affordances. Failures are not fatal.
    pub async fn expand(&self, page: &dyn PageHandle) -> Result<ActionOutcome, ExtractionError> {
        match page.evaluate(&self.profile.expand_script()).await {
            Ok(v) => match v.as_u64() {
                Some(n) if n > 0 => {
                    debug!("expanded {} truncated item(s)", n);
                    Ok(ActionOutcome::Handled)
                }
                _ => Ok(ActionOutcome::NotFound),
            },
            Err(e) if e.is_closed() => Err(ExtractionError::PageClosed),
            Err(e) => {
                debug!("expand step failed: {}", e);
                Ok(ActionOutcome::Failed)
            }
        }
    }

    /// Read rendered items and keep those with a canonical key and a body.
    pub async fn read_items(
        &self,
        page: &dyn PageHandle,
        source_list: &str,
    ) -> Result<Vec<ExtractionRecord>, ExtractionError> {
        let raw = page
            .evaluate(&self.profile.read_items_script())
            .await
            .map_err(page_error)?;
        let items: Vec<RawFeedItem> = match raw {
            Value::Array(_) => serde_json::from_value(raw).unwrap_or_else(|e| {
                warn!("could not decode rendered items: {}", e);
                Vec::new()
            }),
            Value::Null => Vec::new(),
            other => {
                warn!("unexpected item payload type: {}", other);
                Vec::new()
            }
        };

        let now = Utc::now();
        Ok(items
            .into_iter()
            .filter_map(|item| item.into_record(source_list, now))
            .filter_map(|mut record| {
                record.key = self.profile.canonical_key(&record.key)?;
                Some(record)
            })
            .collect())
    }

    fn random_scroll_px(&self) -> u32 {
        let mut rng = rand::rng();
        let (lo, hi) = (self.settings.scroll_min_px, self.settings.scroll_max_px);
        Uniform::new_inclusive(lo, hi)
            .map(|dist| dist.sample(&mut rng))
            .unwrap_or(lo)
    }

    fn random_delay(&self) -> Duration {
        let ms = {
            let mut rng = rand::rng();
            let (lo, hi) = (self.settings.delay_min_ms, self.settings.delay_max_ms);
            Uniform::new_inclusive(lo, hi)
                .map(|dist| dist.sample(&mut rng))
                .unwrap_or(lo)
        };
        Duration::from_millis(ms)
    }

    async fn flush(&self, batch: Vec<ExtractionRecord>, summary: &mut ExtractionSummary) {
        if batch.is_empty() {
            return;
        }
        let n = batch.len();
        summary.flush_sizes.push(n);
        match self.sink.store(&batch).await {
            Ok(outcome) => {
                summary.stored += outcome.inserted;
                summary.skipped_duplicates += outcome.skipped;
                info!(
                    "flushed {} record(s): {} stored, {} already present",
                    n, outcome.inserted, outcome.skipped
                );
            }
            Err(e) => {
                summary.dropped += n;
                error!("dropping batch of {} record(s) after retries: {}", n, e);
            }
        }
    }

    /// Run until end of feed, `max_iterations`, or cancellation.
    pub async fn run(
        &self,
        page: &dyn PageHandle,
        source_list: &str,
        max_iterations: u32,
    ) -> Result<ExtractionRun, ExtractionError> {
        let mut dedup = DedupIndex::new();
        let mut pending = PendingBatch::new(self.settings.batch_size);
        let mut collected = Vec::new();
        let mut summary = ExtractionSummary {
            iterations: 0,
            unique_seen: 0,
            stored: 0,
            skipped_duplicates: 0,
            dropped: 0,
            flush_sizes: Vec::new(),
            termination: Termination::MaxIterations,
        };
        let stall_limit = self.settings.stall_limit.max(1);
        let stall_ceiling = self.settings.max_stall_duration();
        let mut stalled = 0u32;
        let mut last_new_at = Instant::now();

        while summary.iterations < max_iterations {
            if self.cancel.is_cancelled() {
                info!("extraction cancelled after {} iteration(s)", summary.iterations);
                summary.termination = Termination::Cancelled;
                break;
            }
            if page.is_closed() {
                return Err(ExtractionError::PageClosed);
            }
            summary.iterations += 1;
            let iteration = summary.iterations;

            self.expand(page).await?;
            let candidates = self.read_items(page, source_list).await?;

            let mut fresh = 0usize;
            for record in candidates {
                if dedup.insert(&record.key) {
                    fresh += 1;
                    collected.push(record.clone());
                    pending.push(record);
                }
            }

            if fresh > 0 {
                stalled = 0;
                last_new_at = Instant::now();
                debug!(
                    "iteration {}: {} new item(s), {} seen",
                    iteration,
                    fresh,
                    dedup.len()
                );
                while pending.is_full() {
                    let batch = pending.take_batch();
                    self.flush(batch, &mut summary).await;
                }
            } else {
                stalled += 1;
                debug!("iteration {}: nothing new (stall {}/{})", iteration, stalled, stall_limit);
                if stalled >= stall_limit {
                    info!("end of feed after {} iteration(s)", iteration);
                    summary.termination = Termination::StallLimit;
                    break;
                }
                if let Some(ceiling) = stall_ceiling {
                    if last_new_at.elapsed() >= ceiling {
                        info!(
                            "no new items for {:?}; stopping after {} iteration(s)",
                            ceiling, iteration
                        );
                        summary.termination = Termination::StallTimeout;
                        break;
                    }
                }
            }

            if summary.iterations >= max_iterations {
                break;
            }

            let px = self.random_scroll_px();
            if let Err(e) = page.evaluate(&scroll_script(px)).await {
                if e.is_closed() {
                    return Err(ExtractionError::PageClosed);
                }
                warn!("scroll failed: {}", e);
            }
            tokio::time::sleep(self.random_delay()).await;
        }

        while !pending.is_empty() {
            let batch = pending.take_batch();
            self.flush(batch, &mut summary).await;
        }

        summary.unique_seen = dedup.len();
        info!(
            "extraction finished ({:?}): {} iteration(s), {} unique, {} stored, {} dropped",
            summary.termination,
            summary.iterations,
            summary.unique_seen,
            summary.stored,
            summary.dropped
        );
        Ok(ExtractionRun {
            records: collected,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str) -> ExtractionRecord {
        ExtractionRecord {
            key: key.to_string(),
            body: "body".into(),
            source_list: "g".into(),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn dedup_rejects_repeats() {
        let mut idx = DedupIndex::new();
        assert!(idx.insert("a"));
        assert!(!idx.insert("a"));
        assert!(idx.insert("b"));
        assert_eq!(idx.len(), 2);
        assert!(idx.contains("a"));
    }

    #[test]
    fn batch_drains_in_threshold_chunks() {
        let mut batch = PendingBatch::new(3);
        for i in 0..7 {
            batch.push(record(&format!("k{}", i)));
        }
        assert!(batch.is_full());
        assert_eq!(batch.take_batch().len(), 3);
        assert_eq!(batch.take_batch().len(), 3);
        assert!(!batch.is_full());
        let rest = batch.take_batch();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].key, "k6");
        assert!(batch.is_empty());
    }
}
