//! Bounded pool of store client handles.
//!
//! * Handles are reused by operation tag: an idle entry with the same tag and
//!   an idle age under `idle_timeout` is handed out before anything new is
//!   opened.
//! * At most `max_active` handles are active (leased or being opened) at once,
//!   whether the lease is a reuse or a fresh handle. Idle entries do not hold
//!   a slot. Further requests wait in a FIFO queue, bounded by
//!   `acquire_timeout`.
//! * Dropping a [`PooledConnection`] releases it; release services the next
//!   waiter, preferring reuse over creation.
//! * A sweep task, started on first acquisition, evicts entries idle beyond
//!   `idle_timeout`. [`ResourcePool::shutdown`] drains everything.
//!
//! The pool is shared by every concurrent crawl in the process; its mutex is
//! never held across an await.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::config::PoolSettings;
use crate::core::error::PoolError;
use crate::core::retry::{Retry, RetryPolicy};

/// Opens (and optionally closes) the handles the pool manages.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    async fn connect(&self, tag: &str) -> Result<Self::Connection, PoolError>;

    /// Called when an entry is evicted or drained.
    async fn close(&self, _conn: Arc<Self::Connection>) {}
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_active: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub acquire_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(s: &PoolSettings) -> Self {
        Self {
            max_active: s.max_active.max(1),
            idle_timeout: Duration::from_secs(s.idle_timeout_secs),
            sweep_interval: Duration::from_secs(s.sweep_interval_secs.max(1)),
            acquire_timeout: Duration::from_secs(s.acquire_timeout_secs),
            retry: s.retry.clone(),
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    pub created: u64,
    pub reused: u64,
    pub evicted: u64,
    pub peak_active: usize,
}

struct PoolEntry<C> {
    tag: String,
    created_at: Instant,
    last_used: Instant,
    active: bool,
    conn: Arc<C>,
}

enum Grant<F: ConnectionFactory> {
    Reuse(PooledConnection<F>),
    Create(CreatePermit<F>),
}

impl<F: ConnectionFactory> Grant<F> {
    /// Consume without running release side effects.
    fn disarm(self) {
        match self {
            Grant::Reuse(lease) => lease.disarm(),
            Grant::Create(permit) => permit.disarm(),
        }
    }
}

struct Waiter<F: ConnectionFactory> {
    id: u64,
    tag: String,
    tx: oneshot::Sender<Grant<F>>,
}

struct PoolState<F: ConnectionFactory> {
    entries: HashMap<u64, PoolEntry<F::Connection>>,
    active: HashSet<u64>,
    waiters: VecDeque<Waiter<F>>,
    pending_creates: usize,
    shut_down: bool,
    created: u64,
    reused: u64,
    evicted: u64,
    peak_active: usize,
}

impl<F: ConnectionFactory> PoolState<F> {
    fn in_use(&self) -> usize {
        self.active.len() + self.pending_creates
    }

    fn note_peak(&mut self) {
        self.peak_active = self.peak_active.max(self.in_use());
    }

    /// Most recently used idle entry with `tag` that is still fresh.
    fn find_idle(&self, tag: &str, idle_timeout: Duration, now: Instant) -> Option<u64> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.active && e.tag == tag && now.duration_since(e.last_used) < idle_timeout)
            .max_by_key(|(_, e)| e.last_used)
            .map(|(id, _)| *id)
    }

    fn mark_active(&mut self, id: u64) -> Option<Arc<F::Connection>> {
        let conn = {
            let entry = self.entries.get_mut(&id)?;
            entry.active = true;
            entry.conn.clone()
        };
        self.active.insert(id);
        self.note_peak();
        Some(conn)
    }

    fn mark_idle(&mut self, id: u64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.active = false;
            entry.last_used = Instant::now();
        }
        self.active.remove(&id);
    }
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn lock(&self) -> MutexGuard<'_, PoolState<F>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Hand freed capacity to queued requests, oldest first. Reuse and
    /// creation both take a slot, so nothing is granted at the cap.
    fn service_waiters(this: &Arc<Self>, st: &mut PoolState<F>) {
        let now = Instant::now();
        while let Some(front) = st.waiters.front() {
            if st.in_use() >= this.config.max_active {
                break;
            }
            if let Some(id) = st.find_idle(&front.tag, this.config.idle_timeout, now) {
                let Some(waiter) = st.waiters.pop_front() else { break };
                let Some(conn) = st.mark_active(id) else { continue };
                let lease = PooledConnection {
                    pool: this.clone(),
                    id,
                    conn,
                    armed: true,
                };
                match waiter.tx.send(Grant::Reuse(lease)) {
                    Ok(()) => st.reused += 1,
                    Err(grant) => {
                        grant.disarm();
                        st.mark_idle(id);
                    }
                }
                continue;
            }

            let Some(waiter) = st.waiters.pop_front() else { break };
            st.pending_creates += 1;
            st.note_peak();
            let permit = CreatePermit {
                pool: this.clone(),
                armed: true,
            };
            if let Err(grant) = waiter.tx.send(Grant::Create(permit)) {
                grant.disarm();
                st.pending_creates -= 1;
            }
        }
    }

    /// Close `conn` on a background task. Used where no `.await` is possible.
    fn close_detached(this: &Arc<Self>, conn: Arc<F::Connection>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = this.clone();
                handle.spawn(async move { pool.factory.close(conn).await });
            }
            Err(_) => warn!("pool: no runtime to close a returned connection; dropping it"),
        }
    }

    fn release(this: &Arc<Self>, id: u64) {
        let mut st = this.lock();
        if st.shut_down {
            st.active.remove(&id);
            let Some(entry) = st.entries.remove(&id) else { return };
            st.evicted += 1;
            drop(st);
            debug!("pool: closing '{}' entry {} returned after shutdown", entry.tag, id);
            Self::close_detached(this, entry.conn);
            return;
        }
        st.mark_idle(id);
        Self::service_waiters(this, &mut st);
    }

    fn cancel_create(this: &Arc<Self>) {
        let mut st = this.lock();
        st.pending_creates = st.pending_creates.saturating_sub(1);
        if !st.shut_down {
            Self::service_waiters(this, &mut st);
        }
    }

    /// Remove idle entries past the idle timeout; returns their handles for closing.
    fn take_expired(&self) -> Vec<(u64, Arc<F::Connection>)> {
        let now = Instant::now();
        let mut st = self.lock();
        let expired: Vec<u64> = st
            .entries
            .iter()
            .filter(|(_, e)| !e.active && now.duration_since(e.last_used) >= self.config.idle_timeout)
            .map(|(id, _)| *id)
            .collect();
        let mut out = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(entry) = st.entries.remove(&id) {
                st.evicted += 1;
                debug!(
                    "pool: evicting idle '{}' entry {} (age {:?})",
                    entry.tag,
                    id,
                    now.duration_since(entry.created_at)
                );
                out.push((id, entry.conn));
            }
        }
        out
    }
}

/// Capacity reserved for opening a new handle. Dropping it unopened gives the
/// slot back.
struct CreatePermit<F: ConnectionFactory> {
    pool: Arc<PoolInner<F>>,
    armed: bool,
}

impl<F: ConnectionFactory> CreatePermit<F> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<F: ConnectionFactory> Drop for CreatePermit<F> {
    fn drop(&mut self) {
        if self.armed {
            PoolInner::cancel_create(&self.pool);
        }
    }
}

/// A leased handle. Released back to the pool on drop.
pub struct PooledConnection<F: ConnectionFactory> {
    pool: Arc<PoolInner<F>>,
    id: u64,
    conn: Arc<F::Connection>,
    armed: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Owned handle to the underlying connection, for moving into a future.
    pub fn handle(&self) -> Arc<F::Connection> {
        self.conn.clone()
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &F::Connection {
        &self.conn
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            PoolInner::release(&self.pool, self.id);
        }
    }
}

enum Step<F: ConnectionFactory> {
    Leased(PooledConnection<F>),
    Create(CreatePermit<F>),
    Wait(u64, oneshot::Receiver<Grant<F>>),
}

/// Attempt-level error inside `with_connection`.
enum Attempt<E> {
    Pool(PoolError),
    Op(E),
}

impl<E: Display> Display for Attempt<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Attempt::Pool(e) => write!(f, "{}", e),
            Attempt::Op(e) => write!(f, "{}", e),
        }
    }
}

pub struct ResourcePool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ConnectionFactory> ResourcePool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                state: Mutex::new(PoolState {
                    entries: HashMap::new(),
                    active: HashSet::new(),
                    waiters: VecDeque::new(),
                    pending_creates: 0,
                    shut_down: false,
                    created: 0,
                    reused: 0,
                    evicted: 0,
                    peak_active: 0,
                }),
                sweeper: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.inner.lock();
        let active = st.active.len();
        PoolStats {
            total: st.entries.len(),
            active,
            idle: st.entries.len().saturating_sub(active),
            waiting: st.waiters.len(),
            created: st.created,
            reused: st.reused,
            evicted: st.evicted,
            peak_active: st.peak_active,
        }
    }

    fn ensure_sweeper(&self) {
        let mut slot = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return;
        }
        let weak: Weak<PoolInner<F>> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sweep_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let expired = inner.take_expired();
                if !expired.is_empty() {
                    info!("pool: swept {} idle connection(s)", expired.len());
                }
                for (_, conn) in expired {
                    inner.factory.close(conn).await;
                }
            }
        }));
    }

    /// Lease a handle for `tag`: reuse, create, or wait in line.
    pub async fn acquire(&self, tag: &str) -> Result<PooledConnection<F>, PoolError> {
        let step = {
            let mut st = self.inner.lock();
            if st.shut_down {
                return Err(PoolError::ShutDown);
            }
            self.next_step(&mut st, tag)
        };
        self.ensure_sweeper();

        match step {
            Step::Leased(lease) => Ok(lease),
            Step::Create(permit) => self.create(tag, permit).await,
            Step::Wait(waiter_id, mut rx) => {
                let timeout = self.inner.config.acquire_timeout;
                let grant = match tokio::time::timeout(timeout, &mut rx).await {
                    Ok(Ok(grant)) => grant,
                    Ok(Err(_)) => return Err(PoolError::ShutDown),
                    Err(_) => {
                        let still_queued = {
                            let mut st = self.inner.lock();
                            let before = st.waiters.len();
                            st.waiters.retain(|w| w.id != waiter_id);
                            st.waiters.len() != before
                        };
                        if still_queued {
                            warn!("pool: '{}' waited {:?} without a free slot", tag, timeout);
                            return Err(PoolError::AcquireTimeout(timeout));
                        }
                        // Serviced between the deadline and the dequeue.
                        rx.await.map_err(|_| PoolError::ShutDown)?
                    }
                };
                match grant {
                    Grant::Reuse(lease) => Ok(lease),
                    Grant::Create(permit) => self.create(tag, permit).await,
                }
            }
        }
    }

    fn next_step(&self, st: &mut PoolState<F>, tag: &str) -> Step<F> {
        // Queue non-empty means the cap is contended: keep FIFO order.
        if st.waiters.is_empty() && st.in_use() < self.inner.config.max_active {
            if let Some(id) = st.find_idle(tag, self.inner.config.idle_timeout, Instant::now()) {
                if let Some(conn) = st.mark_active(id) {
                    st.reused += 1;
                    return Step::Leased(PooledConnection {
                        pool: self.inner.clone(),
                        id,
                        conn,
                        armed: true,
                    });
                }
            }
            st.pending_creates += 1;
            st.note_peak();
            return Step::Create(CreatePermit {
                pool: self.inner.clone(),
                armed: true,
            });
        }

        let (tx, rx) = oneshot::channel();
        let waiter_id = self.inner.next_id();
        st.waiters.push_back(Waiter {
            id: waiter_id,
            tag: tag.to_string(),
            tx,
        });
        debug!("pool: '{}' queued ({} waiting)", tag, st.waiters.len());
        PoolInner::service_waiters(&self.inner, st);
        Step::Wait(waiter_id, rx)
    }

    async fn create(
        &self,
        tag: &str,
        permit: CreatePermit<F>,
    ) -> Result<PooledConnection<F>, PoolError> {
        // On error the permit drops here and frees its slot.
        let conn = Arc::new(self.inner.factory.connect(tag).await?);

        let id = self.inner.next_id();
        let now = Instant::now();
        let mut st = self.inner.lock();
        permit.disarm();
        st.pending_creates = st.pending_creates.saturating_sub(1);
        st.entries.insert(
            id,
            PoolEntry {
                tag: tag.to_string(),
                created_at: now,
                last_used: now,
                active: true,
                conn: conn.clone(),
            },
        );
        st.active.insert(id);
        st.created += 1;
        st.note_peak();
        debug!("pool: opened '{}' entry {} ({} active)", tag, id, st.active.len());
        Ok(PooledConnection {
            pool: self.inner.clone(),
            id,
            conn,
            armed: true,
        })
    }

    /// Acquire, run `op`, release; the whole cycle retried per the pool's
    /// retry policy with a fresh lease each attempt.
    pub async fn with_connection<T, E, Op, Fut>(&self, tag: &str, op: Op) -> Result<T, PoolError>
    where
        Op: Fn(Arc<F::Connection>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let pool = self;
        let op = &op;
        let classify = |e: &Attempt<E>| match e {
            Attempt::Pool(PoolError::ShutDown) => Retry::No,
            _ => Retry::Yes,
        };
        let label = format!("pool '{}'", tag);

        let result = self
            .inner
            .config
            .retry
            .run(&label, classify, move |_attempt| async move {
                let lease = pool.acquire(tag).await.map_err(Attempt::Pool)?;
                let outcome = op(lease.handle()).await;
                drop(lease);
                outcome.map_err(Attempt::Op)
            })
            .await;

        result.map_err(|exhausted| match exhausted.last {
            Attempt::Pool(PoolError::ShutDown) => PoolError::ShutDown,
            last => PoolError::Exhausted {
                tag: tag.to_string(),
                attempts: exhausted.attempts,
                last: last.to_string(),
            },
        })
    }

    /// Evict expired idle entries now. Returns how many were closed.
    pub async fn sweep(&self) -> usize {
        let expired = self.inner.take_expired();
        let n = expired.len();
        for (_, conn) in expired {
            self.inner.factory.close(conn).await;
        }
        n
    }

    /// Stop the sweeper, fail queued requests, close idle entries. Leases
    /// still out are closed on a background task as they come back.
    pub async fn shutdown(&self) -> usize {
        if let Some(handle) = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }

        let (idle, waiters) = {
            let mut st = self.inner.lock();
            st.shut_down = true;
            let idle_ids: Vec<u64> = st
                .entries
                .iter()
                .filter(|(_, e)| !e.active)
                .map(|(id, _)| *id)
                .collect();
            let mut idle = Vec::with_capacity(idle_ids.len());
            for id in idle_ids {
                if let Some(entry) = st.entries.remove(&id) {
                    st.evicted += 1;
                    idle.push(entry.conn);
                }
            }
            let waiters: Vec<Waiter<F>> = st.waiters.drain(..).collect();
            (idle, waiters)
        };
        // Dropping the senders wakes every waiter with `ShutDown`.
        drop(waiters);

        let closed = idle.len();
        for conn in idle {
            self.inner.factory.close(conn).await;
        }
        info!("pool: shut down ({} idle connection(s) closed)", closed);
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingFactory {
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    struct Conn(usize);

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        type Connection = Conn;

        async fn connect(&self, _tag: &str) -> Result<Conn, PoolError> {
            Ok(Conn(self.opened.fetch_add(1, Ordering::SeqCst)))
        }

        async fn close(&self, _conn: Arc<Conn>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(max_active: usize) -> PoolConfig {
        PoolConfig {
            max_active,
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(15),
            acquire_timeout: Duration::from_secs(5),
            retry: RetryPolicy::new(3, Duration::from_millis(10)),
        }
    }

    #[tokio::test]
    async fn same_tag_reuses_entry() {
        let pool = ResourcePool::new(CountingFactory::default(), config(2));
        let first = pool.acquire("upsert").await.unwrap().id();
        let second = pool.acquire("upsert").await.unwrap().id();
        assert_eq!(first, second);
        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
    }

    #[tokio::test]
    async fn different_tag_opens_new_entry() {
        let pool = ResourcePool::new(CountingFactory::default(), config(2));
        let a = pool.acquire("upsert").await.unwrap().id();
        let b = pool.acquire("select").await.unwrap().id();
        assert_ne!(a, b);
        assert_eq!(pool.stats().total, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_when_cap_held() {
        let pool = ResourcePool::new(CountingFactory::default(), config(1));
        let _held = pool.acquire("upsert").await.unwrap();
        let err = pool.acquire("upsert").await.err().unwrap();
        assert!(matches!(err, PoolError::AcquireTimeout(_)));
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test]
    async fn release_hands_entry_to_waiter() {
        let pool = ResourcePool::new(CountingFactory::default(), config(1));
        let held = pool.acquire("upsert").await.unwrap();
        let held_id = held.id();

        let p = pool.clone();
        let waiter = tokio::spawn(async move { p.acquire("upsert").await.map(|l| l.id()) });
        while pool.stats().waiting == 0 {
            tokio::task::yield_now().await;
        }

        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), held_id);
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_expired_idle_entries() {
        let factory = CountingFactory::default();
        let closed = factory.closed.clone();
        let pool = ResourcePool::new(factory, config(2));
        drop(pool.acquire("upsert").await.unwrap());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(pool.sweep().await, 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn with_connection_retries_with_fresh_lease() {
        let pool = ResourcePool::new(CountingFactory::default(), config(2));
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let out = pool
            .with_connection("upsert", |conn: Arc<Conn>| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(format!("boom on conn {}", conn.0))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn with_connection_exhaustion_reports_last_error() {
        let pool = ResourcePool::new(CountingFactory::default(), config(2));
        let err = pool
            .with_connection("upsert", |_conn: Arc<Conn>| async { Err::<(), _>("store down") })
            .await
            .unwrap_err();
        match err {
            PoolError::Exhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "store down");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn lease_returned_after_shutdown_is_closed() {
        let factory = CountingFactory::default();
        let closed = factory.closed.clone();
        let pool = ResourcePool::new(factory, config(2));
        let held = pool.acquire("upsert").await.unwrap();

        assert_eq!(pool.shutdown().await, 0);
        drop(held);
        while closed.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.stats().total, 0);
        assert_eq!(pool.stats().evicted, 1);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let factory = CountingFactory::default();
        let closed = factory.closed.clone();
        let pool = ResourcePool::new(factory, config(2));
        drop(pool.acquire("upsert").await.unwrap());
        assert_eq!(pool.shutdown().await, 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(matches!(pool.acquire("upsert").await, Err(PoolError::ShutDown)));
    }
}
