//! In-memory fakes for the driver and store seams.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use feed_harvester::core::config::HarvestConfig;
use feed_harvester::core::error::{DriverError, PoolError, StoreError};
use feed_harvester::driver::{BrowserDriver, BrowserProcess, LaunchConfig, PageHandle, PageSetup};
use feed_harvester::pool::{ConnectionFactory, PoolConfig, ResourcePool};
use feed_harvester::session_store::SessionCookie;
use feed_harvester::sink::{PooledRecordSink, RecordSink};
use feed_harvester::store::{Filter, StoreClient};
use feed_harvester::{ExtractionRecord, RetryPolicy, SourceList, UpsertOutcome};

pub fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn post_url(n: usize) -> String {
    format!("https://feed.test/groups/1/posts/{}", n)
}

/// Frame with items `range` as `{key, body}`.
pub fn frame(range: std::ops::Range<usize>) -> Vec<(String, String)> {
    range.map(|n| (post_url(n), format!("post body {}", n))).collect()
}

// ── Page ─────────────────────────────────────────────────────────────────────

/// What the fake page renders on each read.
pub enum Feed {
    /// Frame `i` is what is rendered after `i` scrolls; the last frame repeats.
    Frames(Vec<Vec<(String, String)>>),
    /// Every read renders one item never seen before.
    Endless,
}

pub struct FakePage {
    feed: Feed,
    scrolls: AtomicUsize,
    reads: AtomicUsize,
    pub goto_calls: AtomicUsize,
    goto_failures: AtomicUsize,
    pub reload_calls: AtomicUsize,
    ready_after_reload_only: bool,
    never_ready: bool,
    consent: Mutex<String>,
    /// Fail reads from this read number (1-based) on.
    fail_read_from: Option<usize>,
    closed: AtomicBool,
    fail_close: bool,
    pub close_calls: AtomicUsize,
    pub cookies_set: AtomicUsize,
}

impl FakePage {
    pub fn new(feed: Feed) -> Self {
        Self {
            feed,
            scrolls: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            goto_calls: AtomicUsize::new(0),
            goto_failures: AtomicUsize::new(0),
            reload_calls: AtomicUsize::new(0),
            ready_after_reload_only: false,
            never_ready: false,
            consent: Mutex::new("not_found".to_string()),
            fail_read_from: None,
            closed: AtomicBool::new(false),
            fail_close: false,
            close_calls: AtomicUsize::new(0),
            cookies_set: AtomicUsize::new(0),
        }
    }

    pub fn frames(frames: Vec<Vec<(String, String)>>) -> Self {
        Self::new(Feed::Frames(frames))
    }

    pub fn failing_goto(self, times: usize) -> Self {
        self.goto_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn ready_only_after_reload(mut self) -> Self {
        self.ready_after_reload_only = true;
        self
    }

    pub fn never_ready(mut self) -> Self {
        self.never_ready = true;
        self
    }

    pub fn with_consent(self, outcome: &str) -> Self {
        *self.consent.lock().unwrap() = outcome.to_string();
        self
    }

    pub fn failing_reads_from(mut self, read: usize) -> Self {
        self.fail_read_from = Some(read);
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn scrolls(&self) -> usize {
        self.scrolls.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn rendered(&self) -> Value {
        let items: Vec<Value> = match &self.feed {
            Feed::Frames(frames) => {
                if frames.is_empty() {
                    return json!([]);
                }
                let idx = self.scrolls().min(frames.len() - 1);
                frames[idx]
                    .iter()
                    .map(|(k, b)| json!({"key": k, "body": b}))
                    .collect()
            }
            Feed::Endless => {
                let n = self.reads();
                vec![json!({"key": post_url(n), "body": format!("post body {}", n)})]
            }
        };
        Value::Array(items)
    }
}

#[async_trait]
impl PageHandle for FakePage {
    async fn goto(&self, _url: &str) -> Result<(), DriverError> {
        self.goto_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.goto_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.goto_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::Timeout(Duration::from_secs(30)));
        }
        Ok(())
    }

    async fn reload(&self) -> Result<(), DriverError> {
        self.reload_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        if script.contains("window.scrollBy") {
            self.scrolls.fetch_add(1, Ordering::SeqCst);
            return Ok(Value::Null);
        }
        if script.contains("ready_state") {
            return Ok(json!({"url": "https://feed.test/groups/1", "title": "Feed", "ready_state": "complete", "body_length": 42}));
        }
        if script.contains("not_found") {
            return Ok(Value::String(self.consent.lock().unwrap().clone()));
        }
        if script.contains("clicked") {
            return Ok(json!(0));
        }
        if script.contains("length > 0") {
            let ready = !self.never_ready
                && (!self.ready_after_reload_only || self.reload_calls.load(Ordering::SeqCst) > 0);
            return Ok(Value::Bool(ready));
        }
        if script.contains("bodyEl") {
            let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            if matches!(self.fail_read_from, Some(from) if read >= from) {
                return Err(DriverError::Protocol("websocket connection reset".into()));
            }
            return Ok(self.rendered());
        }
        Ok(Value::Null)
    }

    async fn content(&self) -> Result<String, DriverError> {
        Ok("<html><body>feed</body></html>".to_string())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        Err(DriverError::Other("screenshots unsupported in fake".into()))
    }

    async fn set_cookies(&self, cookies: &[SessionCookie]) -> Result<usize, DriverError> {
        self.cookies_set.fetch_add(cookies.len(), Ordering::SeqCst);
        Ok(cookies.len())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(DriverError::Protocol("target closed".into()));
        }
        Ok(())
    }
}

// ── Driver / process ─────────────────────────────────────────────────────────

pub struct FakeDriver {
    /// Page handed to the first launch.
    pub page: Arc<FakePage>,
    /// Pages for later launches; once drained, `page` is reused.
    later_pages: Mutex<std::collections::VecDeque<Arc<FakePage>>>,
    pub launch_calls: AtomicUsize,
    launch_failures: AtomicUsize,
    successful_launches: AtomicUsize,
    pub process_close_calls: Arc<AtomicUsize>,
}

impl FakeDriver {
    pub fn new(page: FakePage) -> Self {
        Self {
            page: Arc::new(page),
            later_pages: Mutex::new(std::collections::VecDeque::new()),
            launch_calls: AtomicUsize::new(0),
            launch_failures: AtomicUsize::new(0),
            successful_launches: AtomicUsize::new(0),
            process_close_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_launches(self, times: usize) -> Self {
        self.launch_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn then_pages(self, pages: Vec<FakePage>) -> Self {
        self.later_pages
            .lock()
            .unwrap()
            .extend(pages.into_iter().map(Arc::new));
        self
    }

    pub fn launches(&self) -> usize {
        self.launch_calls.load(Ordering::SeqCst)
    }

    pub fn process_closes(&self) -> usize {
        self.process_close_calls.load(Ordering::SeqCst)
    }

    pub fn page_closes(&self) -> usize {
        self.page.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn launch(&self, _config: &LaunchConfig) -> Result<Box<dyn BrowserProcess>, DriverError> {
        self.launch_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.launch_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.launch_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::Launch("chrome exited with status 1".into()));
        }
        let succeeded = self.successful_launches.fetch_add(1, Ordering::SeqCst);
        let page = if succeeded == 0 {
            self.page.clone()
        } else {
            self.later_pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.page.clone())
        };
        Ok(Box::new(FakeProcess {
            page,
            close_calls: self.process_close_calls.clone(),
            connected: AtomicBool::new(true),
        }))
    }
}

pub struct FakeProcess {
    page: Arc<FakePage>,
    close_calls: Arc<AtomicUsize>,
    connected: AtomicBool,
}

#[async_trait]
impl BrowserProcess for FakeProcess {
    async fn new_page(&self, _setup: &PageSetup) -> Result<Arc<dyn PageHandle>, DriverError> {
        Ok(self.page.clone())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ── Store ────────────────────────────────────────────────────────────────────

/// Upserts keyed on `post_url`; batches containing a poisoned key always fail.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<Value>>,
    keys: Mutex<HashSet<String>>,
    poisoned: Mutex<HashSet<String>>,
    pub upsert_calls: AtomicUsize,
    /// Sizes of every upsert call, including failed ones.
    pub call_sizes: Mutex<Vec<usize>>,
}

impl MemoryStore {
    pub fn poison(&self, key: impl Into<String>) {
        self.poisoned.lock().unwrap().insert(key.into());
    }

    pub fn stored_keys(&self) -> HashSet<String> {
        self.keys.lock().unwrap().clone()
    }
}

pub struct MemoryConn {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl StoreClient for MemoryConn {
    async fn upsert(
        &self,
        _table: &str,
        records: &[Value],
        conflict_key: &str,
    ) -> Result<UpsertOutcome, StoreError> {
        let store = &self.store;
        store.upsert_calls.fetch_add(1, Ordering::SeqCst);
        store.call_sizes.lock().unwrap().push(records.len());

        let keys: Vec<String> = records
            .iter()
            .filter_map(|r| r[conflict_key].as_str().map(str::to_string))
            .collect();
        if keys.iter().any(|k| store.poisoned.lock().unwrap().contains(k)) {
            return Err(StoreError::Rejected {
                status: 503,
                body: "remaining connection slots are reserved".into(),
            });
        }

        let mut seen = store.keys.lock().unwrap();
        let mut out = UpsertOutcome::default();
        for (key, row) in keys.into_iter().zip(records) {
            if seen.insert(key) {
                store.rows.lock().unwrap().push(row.clone());
                out.inserted += 1;
            } else {
                out.skipped += 1;
            }
        }
        Ok(out)
    }

    async fn select(
        &self,
        _table: &str,
        filters: &[Filter],
        limit: usize,
    ) -> Result<Vec<Value>, StoreError> {
        let rows = self.store.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|r| filters.iter().all(|f| r[&f.column] == f.value.as_str()))
            .take(limit)
            .cloned()
            .collect())
    }
}

pub struct MemoryFactory {
    pub store: Arc<MemoryStore>,
    pub opened: AtomicUsize,
}

impl MemoryFactory {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            opened: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ConnectionFactory for MemoryFactory {
    type Connection = MemoryConn;

    async fn connect(&self, _tag: &str) -> Result<MemoryConn, PoolError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConn {
            store: self.store.clone(),
        })
    }
}

pub fn pool_config(max_active: usize) -> PoolConfig {
    PoolConfig {
        max_active,
        idle_timeout: Duration::from_secs(60),
        sweep_interval: Duration::from_secs(15),
        acquire_timeout: Duration::from_secs(30),
        retry: RetryPolicy::new(3, Duration::from_millis(100)),
    }
}

/// Pool-backed sink over a fresh in-memory store.
pub fn memory_sink(
    store: Arc<MemoryStore>,
) -> (Arc<PooledRecordSink<MemoryFactory>>, ResourcePool<MemoryFactory>) {
    let pool = ResourcePool::new(MemoryFactory::new(store), pool_config(4));
    let sink = Arc::new(PooledRecordSink::new(pool.clone(), "posts", "post_url"));
    (sink, pool)
}

/// Sink that records every flush and never touches a store.
#[derive(Default)]
pub struct RecordingSink {
    pub flushes: Mutex<Vec<Vec<String>>>,
}

impl RecordingSink {
    pub fn flush_sizes(&self) -> Vec<usize> {
        self.flushes.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn all_keys(&self) -> Vec<String> {
        self.flushes.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    async fn store(&self, records: &[ExtractionRecord]) -> Result<UpsertOutcome, PoolError> {
        self.flushes
            .lock()
            .unwrap()
            .push(records.iter().map(|r| r.key.clone()).collect());
        Ok(UpsertOutcome {
            inserted: records.len(),
            skipped: 0,
        })
    }
}

// ── Config ───────────────────────────────────────────────────────────────────

/// Defaults with no proxy, no settle delay, and diagnostics under `debug_dir`.
pub fn test_config(debug_dir: &std::path::Path) -> HarvestConfig {
    let mut cfg = HarvestConfig::default();
    cfg.browser.virtualized = Some(false);
    cfg.browser.launch_retry = RetryPolicy::new(3, Duration::from_millis(200));
    cfg.navigation.retry = RetryPolicy::new(3, Duration::from_millis(200));
    cfg.navigation.readiness_retry = RetryPolicy::new(3, Duration::from_millis(100));
    cfg.navigation.consent_attempts = 1;
    cfg.extraction.batch_size = 10;
    cfg.extraction.stall_limit = 5;
    cfg.extraction.max_iterations = 50;
    cfg.diagnostics.dir = Some(debug_dir.to_path_buf());
    cfg.proxy.url = None;
    cfg.proxy.descriptor = None;
    cfg.lists = vec![list()];
    cfg
}

pub fn list() -> SourceList {
    SourceList {
        id: "g1".into(),
        url: "https://feed.test/groups/1".into(),
    }
}
