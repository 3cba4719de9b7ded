//! Browser-automation driver seam.
//!
//! Session management, navigation, extraction and diagnostics only talk to
//! these traits. `scraping::chromium` implements them over `chromiumoxide`;
//! tests implement them in memory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::error::DriverError;
use crate::core::types::{ProxyCredentials, ProxyDescriptor};
use crate::features::session_store::SessionCookie;

/// Everything needed to start one browser process.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub headless: bool,
    pub executable: Option<String>,
    pub width: u32,
    pub height: u32,
    pub proxy: Option<ProxyDescriptor>,
    pub operation_timeout: Duration,
    pub extra_args: Vec<String>,
    pub user_data_dir: Option<PathBuf>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            width: 1366,
            height: 900,
            proxy: None,
            operation_timeout: Duration::from_secs(30),
            extra_args: Vec::new(),
            user_data_dir: None,
        }
    }
}

/// Page-level wiring applied right after a tab is opened.
#[derive(Debug, Clone, Default)]
pub struct PageSetup {
    pub operation_timeout: Option<Duration>,
    /// Answer proxy auth challenges with these credentials.
    pub proxy_credentials: Option<ProxyCredentials>,
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self, config: &LaunchConfig) -> Result<Box<dyn BrowserProcess>, DriverError>;
}

#[async_trait]
pub trait BrowserProcess: Send + Sync {
    /// Open a tab with `setup` applied before it is handed out.
    async fn new_page(&self, setup: &PageSetup) -> Result<Arc<dyn PageHandle>, DriverError>;

    /// Cheap liveness query; flips to `false` once the process disconnects.
    fn is_connected(&self) -> bool;

    async fn close(&mut self) -> Result<(), DriverError>;
}

#[async_trait]
pub trait PageHandle: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), DriverError>;

    async fn reload(&self) -> Result<(), DriverError>;

    /// Evaluate a script and return its JSON-serialisable result.
    async fn evaluate(&self, script: &str) -> Result<Value, DriverError>;

    /// Full rendered markup.
    async fn content(&self) -> Result<String, DriverError>;

    /// Full-page PNG screenshot.
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;

    /// Inject cookies; returns how many were accepted.
    async fn set_cookies(&self, cookies: &[SessionCookie]) -> Result<usize, DriverError>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), DriverError>;
}
