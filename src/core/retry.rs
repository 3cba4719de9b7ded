//! One retry policy for every retrying call site.
//!
//! Browser launch, navigation, content-readiness waits and store writes all
//! retry the same way and differ only in their parameters and in what they
//! consider retriable. The schedule is linear (`base × attempt × multiplier`),
//! doubled once more when the failure was transport-level. Sleeping and
//! give-up bookkeeping are delegated to `backoff::future::retry_notify`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Give up immediately.
    No,
    /// Retry on the normal schedule.
    Yes,
    /// Retry, with the delay stretched by `transport_multiplier`.
    Transport,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    /// Scales the linear step (`base × attempt × multiplier`).
    pub multiplier: f64,
    /// Extra factor applied when the failure was transport-level.
    pub transport_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 1.0,
            transport_multiplier: 2.0,
        }
    }
}

/// The last error after the policy gave up.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last: E,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based: the delay after the first failure).
    pub fn delay_for(&self, attempt: u32, transport: bool) -> Duration {
        let mut delay = self.base_delay.mul_f64(attempt as f64 * self.multiplier.max(0.0));
        if transport {
            delay = delay.mul_f64(self.transport_multiplier.max(1.0));
        }
        delay
    }

    fn schedule(&self, transport_flag: Arc<AtomicBool>) -> LinearBackoff {
        LinearBackoff {
            policy: self.clone(),
            attempt: 0,
            transport_flag,
        }
    }

    /// Run `op` until it succeeds, `classify` says stop, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, Op, Fut, C>(
        &self,
        label: &str,
        classify: C,
        mut op: Op,
    ) -> Result<T, RetryExhausted<E>>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> Retry,
        E: std::fmt::Display,
    {
        let attempts = AtomicU32::new(0);
        let transport_flag = Arc::new(AtomicBool::new(false));
        let backoff = self.schedule(transport_flag.clone());

        let attempts_ref = &attempts;
        let classify = &classify;
        let op = &mut op;
        let flag = transport_flag.clone();
        let operation = move || {
            let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
            let fut = op(attempt);
            let transport_flag = flag.clone();
            async move {
                match fut.await {
                    Ok(v) => Ok(v),
                    Err(e) => match classify(&e) {
                        Retry::No => Err(backoff::Error::Permanent(e)),
                        Retry::Yes => Err(backoff::Error::transient(e)),
                        Retry::Transport => {
                            transport_flag.store(true, Ordering::SeqCst);
                            Err(backoff::Error::transient(e))
                        }
                    },
                }
            }
        };

        let notify = move |err: E, delay: Duration| {
            warn!(
                "{}: attempt {} failed ({}); retrying in {}ms",
                label,
                attempts_ref.load(Ordering::SeqCst),
                err,
                delay.as_millis()
            );
        };

        backoff::future::retry_notify(backoff, operation, notify)
            .await
            .map_err(|last| RetryExhausted {
                attempts: attempts.load(Ordering::SeqCst),
                last,
            })
    }
}

/// `backoff::backoff::Backoff` implementation of the linear schedule.
struct LinearBackoff {
    policy: RetryPolicy,
    attempt: u32,
    transport_flag: Arc<AtomicBool>,
}

impl backoff::backoff::Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.policy.max_attempts.max(1) {
            return None;
        }
        let transport = self.transport_flag.swap(false, Ordering::SeqCst);
        Some(self.policy.delay_for(self.attempt, transport))
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
