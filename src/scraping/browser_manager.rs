//! Browser session lifecycle.
//!
//! `BrowserSessionManager` is the single source of truth for:
//! * Launching a browser process with bounded, backed-off retries.
//! * Verifying the process is actually usable (stability check) before
//!   handing it out.
//! * Creating fully wired pages.
//!
//! `CrawlSession` owns the process and its pages. `close()` consumes it, so a
//! session is torn down at most once; every page close is attempted even if
//! an earlier one fails, and the process is closed last.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::config::BrowserSettings;
use crate::core::error::{DriverError, SessionAcquisitionError};
use crate::core::retry::Retry;
use crate::core::types::ProxyDescriptor;
use crate::scraping::driver::{BrowserDriver, BrowserProcess, LaunchConfig, PageHandle, PageSetup};

/// One browser process and the pages opened in it, for one crawl.
pub struct CrawlSession {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub connection_stable: bool,
    pub proxy: Option<ProxyDescriptor>,
    process: Box<dyn BrowserProcess>,
    pages: Vec<Arc<dyn PageHandle>>,
    page_setup: PageSetup,
}

/// What teardown managed to close.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub pages_closed: usize,
    pub page_errors: usize,
    pub process_closed: bool,
}

impl std::fmt::Debug for CrawlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlSession")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("connection_stable", &self.connection_stable)
            .field("pages", &self.pages.len())
            .field("connected", &self.process.is_connected())
            .finish()
    }
}

impl CrawlSession {
    /// The page opened during the stability check.
    pub fn primary_page(&self) -> Option<Arc<dyn PageHandle>> {
        self.pages.first().cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.process.is_connected()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Close every page, then the process. Failures are logged, never raised.
    pub async fn close(mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for (idx, page) in self.pages.drain(..).enumerate() {
            match page.close().await {
                Ok(()) => report.pages_closed += 1,
                Err(e) => {
                    report.page_errors += 1;
                    warn!(session = %self.id, "failed to close page {}: {}", idx, e);
                }
            }
        }
        match self.process.close().await {
            Ok(()) => report.process_closed = true,
            Err(e) => error!(session = %self.id, "failed to close browser process: {}", e),
        }
        info!(
            session = %self.id,
            "session closed ({} page(s) closed, {} page error(s), process closed: {})",
            report.pages_closed, report.page_errors, report.process_closed
        );
        report
    }
}

pub struct BrowserSessionManager {
    driver: Arc<dyn BrowserDriver>,
    settings: BrowserSettings,
}

impl BrowserSessionManager {
    pub fn new(driver: Arc<dyn BrowserDriver>, settings: BrowserSettings) -> Self {
        Self { driver, settings }
    }

    /// Launch config derived from settings plus the (already validated) proxy.
    pub fn launch_config(&self, proxy: Option<ProxyDescriptor>) -> LaunchConfig {
        LaunchConfig {
            headless: self.settings.headless,
            executable: self.settings.resolve_executable(),
            width: self.settings.width,
            height: self.settings.height,
            proxy,
            operation_timeout: self.settings.operation_timeout(),
            extra_args: self.settings.extra_args.clone(),
            user_data_dir: None,
        }
    }

    fn page_setup(&self, launch: &LaunchConfig) -> PageSetup {
        PageSetup {
            operation_timeout: Some(launch.operation_timeout),
            proxy_credentials: launch.proxy.as_ref().and_then(|p| p.credentials()),
        }
    }

    /// Launch a browser and prove it usable, retrying per `launch_retry`.
    pub async fn acquire_session(
        &self,
        launch: &LaunchConfig,
    ) -> Result<CrawlSession, SessionAcquisitionError> {
        if self.settings.resolve_virtualized() && !self.settings.settle_delay().is_zero() {
            info!(
                "virtualized environment: settling {}ms before first launch",
                self.settings.settle_delay_ms
            );
            tokio::time::sleep(self.settings.settle_delay()).await;
        }

        let setup = self.page_setup(launch);
        let classify = |e: &DriverError| {
            if e.is_transport() {
                Retry::Transport
            } else {
                Retry::Yes
            }
        };

        let setup_ref = &setup;
        let result = self
            .settings
            .launch_retry
            .run("browser launch", classify, move |attempt| async move {
                info!("browser launch attempt {}", attempt);
                self.launch_and_verify(launch, setup_ref).await
            })
            .await;

        match result {
            Ok((process, page)) => {
                let session = CrawlSession {
                    id: Uuid::new_v4(),
                    created_at: Utc::now(),
                    connection_stable: true,
                    proxy: launch.proxy.clone(),
                    process,
                    pages: vec![page],
                    page_setup: setup,
                };
                info!(session = %session.id, "browser session ready");
                Ok(session)
            }
            Err(exhausted) => {
                error!(
                    "browser session acquisition failed after {} attempt(s): {}",
                    exhausted.attempts, exhausted.last
                );
                Err(SessionAcquisitionError {
                    attempts: exhausted.attempts,
                    last: exhausted.last,
                })
            }
        }
    }

    /// One launch attempt: start the process, open a page, confirm connected.
    /// On any failure the process is torn down before returning.
    async fn launch_and_verify(
        &self,
        launch: &LaunchConfig,
        setup: &PageSetup,
    ) -> Result<(Box<dyn BrowserProcess>, Arc<dyn PageHandle>), DriverError> {
        let mut process = self.driver.launch(launch).await?;

        let page = match process.new_page(setup).await {
            Ok(page) => page,
            Err(e) => {
                warn!("stability check: could not open a page: {}", e);
                if let Err(close_err) = process.close().await {
                    warn!("closing unstable browser failed: {}", close_err);
                }
                return Err(e);
            }
        };

        if !process.is_connected() {
            warn!("stability check: browser reports disconnected after opening a page");
            if let Err(e) = page.close().await {
                warn!("closing page of unstable browser failed: {}", e);
            }
            if let Err(e) = process.close().await {
                warn!("closing unstable browser failed: {}", e);
            }
            return Err(DriverError::Protocol(
                "browser disconnected during stability check".to_string(),
            ));
        }

        Ok((process, page))
    }

    /// Open an additional, fully wired page in `session`.
    pub async fn create_page(
        &self,
        session: &mut CrawlSession,
    ) -> Result<Arc<dyn PageHandle>, DriverError> {
        let page = session.process.new_page(&session.page_setup).await?;
        session.pages.push(page.clone());
        Ok(page)
    }
}
