//! Error taxonomy for every layer of a crawl.
//!
//! Each layer owns one `thiserror` enum. Glue code and the binary convert
//! into `anyhow::Error`; the orchestrator keeps the typed form so callers can
//! tell which stage failed.

use std::sync::OnceLock;
use std::time::Duration;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use thiserror::Error;

use crate::core::types::ProxyValidationResult;

// ── Driver ───────────────────────────────────────────────────────────────────

/// Failure reported by the browser-automation driver.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("page or browser is closed")]
    Closed,

    #[error("in-page evaluation failed: {0}")]
    Evaluation(String),

    #[error("{0}")]
    Other(String),
}

/// Substrings that mark a failure as a transport/protocol-level problem
/// (dead websocket, detached target) rather than a plain launch failure.
const TRANSPORT_PATTERNS: &[&str] = &[
    "websocket",
    "ws error",
    "connection reset",
    "connection closed",
    "broken pipe",
    "target closed",
    "session closed",
    "no response",
    "channel",
    "protocol error",
    "disconnected",
];

static TRANSPORT_MATCHER: OnceLock<AhoCorasick> = OnceLock::new();

fn transport_matcher() -> &'static AhoCorasick {
    TRANSPORT_MATCHER.get_or_init(|| {
        AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostFirst)
            .build(TRANSPORT_PATTERNS)
            .expect("valid transport patterns")
    })
}

/// Returns `true` if an error message looks like a transport-level failure.
pub fn looks_like_transport_error(message: &str) -> bool {
    transport_matcher().is_match(message)
}

impl DriverError {
    /// Classify a raw driver error message into a variant.
    pub fn from_message(context: &str, message: impl std::fmt::Display) -> Self {
        let text = format!("{}: {}", context, message);
        if looks_like_transport_error(&text) {
            DriverError::Protocol(text)
        } else {
            DriverError::Other(text)
        }
    }

    pub fn is_transport(&self) -> bool {
        match self {
            DriverError::Protocol(_) | DriverError::Closed => true,
            DriverError::Launch(msg) | DriverError::Other(msg) | DriverError::Evaluation(msg) => {
                looks_like_transport_error(msg)
            }
            DriverError::Timeout(_) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, DriverError::Closed)
    }
}

// ── Session / navigation / extraction ────────────────────────────────────────

#[derive(Debug, Error)]
#[error("could not acquire a browser session after {attempts} attempt(s): {last}")]
pub struct SessionAcquisitionError {
    pub attempts: u32,
    #[source]
    pub last: DriverError,
}

#[derive(Debug, Error)]
pub enum NavigationError {
    #[error("page closed before navigating to {url}")]
    PageClosed { url: String },

    #[error("navigation to {url} failed: {last}")]
    Failed {
        url: String,
        #[source]
        last: DriverError,
    },

    #[error("content never became ready at {url} (diagnostics: {diagnostics:?})")]
    ContentNotReady {
        url: String,
        diagnostics: Option<std::path::PathBuf>,
    },
}

impl NavigationError {
    pub fn url(&self) -> &str {
        match self {
            NavigationError::PageClosed { url }
            | NavigationError::Failed { url, .. }
            | NavigationError::ContentNotReady { url, .. } => url,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("page closed during extraction")]
    PageClosed,

    #[error("page-level failure during extraction: {0}")]
    Page(#[from] DriverError),
}

// ── Persistence ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(String),

    #[error("store rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("store response could not be decoded: {0}")]
    Decode(String),

    #[error("store is not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out after {0:?} waiting for a pooled connection")]
    AcquireTimeout(Duration),

    #[error("pool is shut down")]
    ShutDown,

    #[error("failed to open connection: {0}")]
    Connect(String),

    #[error("operation '{tag}' failed after {attempts} attempt(s): {last}")]
    Exhausted {
        tag: String,
        attempts: u32,
        last: String,
    },
}

// ── Credentials ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential file not found: {0}")]
    Missing(std::path::PathBuf),

    #[error("credential file {path} is unreadable: {reason}")]
    Unreadable {
        path: std::path::PathBuf,
        reason: String,
    },
}

// ── Orchestrator ─────────────────────────────────────────────────────────────

/// The stage a crawl was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlStage {
    Preflight,
    Credentials,
    Session,
    Navigation,
    Extraction,
}

impl CrawlStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStage::Preflight => "preflight",
            CrawlStage::Credentials => "credentials",
            CrawlStage::Session => "session",
            CrawlStage::Navigation => "navigation",
            CrawlStage::Extraction => "extraction",
        }
    }
}

impl std::fmt::Display for CrawlStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("proxy preflight failed at stage '{}': {}", .0.stage, .0.error.as_deref().unwrap_or("unknown"))]
    Preflight(ProxyValidationResult),

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error(transparent)]
    Session(#[from] SessionAcquisitionError),

    #[error(transparent)]
    Navigation(#[from] NavigationError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("crawl exceeded its overall timeout of {0:?}")]
    Timeout(Duration),
}

impl CrawlError {
    pub fn stage(&self) -> Option<CrawlStage> {
        match self {
            CrawlError::Preflight(_) => Some(CrawlStage::Preflight),
            CrawlError::Credentials(_) => Some(CrawlStage::Credentials),
            CrawlError::Session(_) => Some(CrawlStage::Session),
            CrawlError::Navigation(_) => Some(CrawlStage::Navigation),
            CrawlError::Extraction(_) => Some(CrawlStage::Extraction),
            CrawlError::Timeout(_) => None,
        }
    }
}
