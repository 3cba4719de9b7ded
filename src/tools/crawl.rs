use crate::core::config::HarvestConfig;
use crate::core::error::{CrawlError, ExtractionError, NavigationError};
use crate::core::types::{CrawlReport, ProxyValidationResult, SourceList};
use crate::features::diagnostics::{DiagnosticsContext, DiagnosticsRecorder};
use crate::features::proxy_preflight::ProxyPreflightValidator;
use crate::features::session_store::{self, SessionCookie};
use crate::persistence::sink::RecordSink;
use crate::scraping::browser_manager::{BrowserSessionManager, CrawlSession};
use crate::scraping::driver::{BrowserDriver, LaunchConfig, PageHandle};
use crate::scraping::extraction::{ExtractionLoop, ExtractionRun};
use crate::scraping::navigation::{NavigationController, NAVIGATION_FAILED_STAGE};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Diagnostics stage names used by the orchestrator.
pub const SESSION_FAILED_STAGE: &str = "session-failed";
pub const EXTRACTION_FAILED_STAGE: &str = "extraction-failed";
pub const CRAWL_TIMEOUT_STAGE: &str = "crawl-timeout";

/// Sequences preflight → credentials → session → navigation → extraction,
/// under one overall timeout, and always tears the session down.
pub struct CrawlOrchestrator {
    config: Arc<HarvestConfig>,
    sessions: BrowserSessionManager,
    navigation: NavigationController,
    extraction: ExtractionLoop,
    preflight: ProxyPreflightValidator,
    diagnostics: DiagnosticsRecorder,
    cancel: CancellationToken,
}

impl CrawlOrchestrator {
    pub fn new(
        config: HarvestConfig,
        driver: Arc<dyn BrowserDriver>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        let diagnostics = DiagnosticsRecorder::from_settings(&config.diagnostics);
        Self::with_diagnostics(config, driver, sink, diagnostics)
    }

    pub fn with_diagnostics(
        config: HarvestConfig,
        driver: Arc<dyn BrowserDriver>,
        sink: Arc<dyn RecordSink>,
        diagnostics: DiagnosticsRecorder,
    ) -> Self {
        let cancel = CancellationToken::new();
        Self {
            sessions: BrowserSessionManager::new(driver, config.browser.clone()),
            navigation: NavigationController::new(
                config.navigation.clone(),
                config.feed.clone(),
                diagnostics.clone(),
            ),
            extraction: ExtractionLoop::new(config.extraction.clone(), config.feed.clone(), sink)
                .with_cancellation(cancel.clone()),
            preflight: ProxyPreflightValidator::from_settings(&config.proxy),
            diagnostics,
            cancel,
            config: Arc::new(config),
        }
    }

    /// Token that stops every running extraction at its next iteration.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Proxy check only; no browser is involved.
    pub async fn preflight(&self) -> ProxyValidationResult {
        let configured = self.config.proxy.resolve();
        self.preflight.validate_configured(&configured).await
    }

    /// Crawl one list end to end.
    pub async fn run(&self, list: &SourceList) -> Result<CrawlReport, CrawlError> {
        let started = Instant::now();
        let result = self.run_inner(list).await;
        match &result {
            Ok(report) => info!(
                list = %list.id,
                session = %report.session_id,
                "crawl finished in {:.1}s: {} unique, {} stored, {} dropped",
                started.elapsed().as_secs_f64(),
                report.extraction.unique_seen,
                report.extraction.stored,
                report.extraction.dropped
            ),
            Err(e) => error!(
                list = %list.id,
                stage = e.stage().map(|s| s.as_str()).unwrap_or("timeout"),
                "crawl failed: {}",
                e
            ),
        }
        result.map(|mut report| {
            report.elapsed = started.elapsed();
            report
        })
    }

    async fn run_inner(&self, list: &SourceList) -> Result<CrawlReport, CrawlError> {
        // Preflight: nothing is launched behind a dead proxy.
        let configured = self.config.proxy.resolve();
        let check = self.preflight.validate_configured(&configured).await;
        if !check.success {
            return Err(CrawlError::Preflight(check));
        }
        let proxy = configured.ok().flatten();

        let cookies = session_store::load_for(
            self.config.session.resolve_cookies_path().as_deref(),
            &list.url,
            self.config.session.require_cookies,
        )?;

        let launch = self.sessions.launch_config(proxy);
        let timeout = self.config.crawl.timeout();
        let mut slot: Option<CrawlSession> = None;

        let outcome =
            tokio::time::timeout(timeout, self.drive(list, &launch, &cookies, &mut slot)).await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                let page = slot.as_ref().and_then(|s| s.primary_page());
                let mut context = DiagnosticsContext::new(format!(
                    "crawl exceeded its overall timeout of {:?}",
                    timeout
                ))
                .with_url(&list.url);
                if let Some(session) = &slot {
                    context = context.with_session(session.id);
                }
                self.diagnostics
                    .capture(page.as_deref(), CRAWL_TIMEOUT_STAGE, &context)
                    .await;
                Err(CrawlError::Timeout(timeout))
            }
        };

        self.teardown(slot.take()).await;

        result.map(|(session_id, run)| CrawlReport {
            list_id: list.id.clone(),
            session_id,
            extraction: run.summary,
            elapsed: Duration::ZERO,
        })
    }

    /// Session → navigation → extraction. The session is parked in `slot` as
    /// soon as it exists so teardown can reach it even if this future is
    /// dropped by the timeout.
    async fn drive(
        &self,
        list: &SourceList,
        launch: &LaunchConfig,
        cookies: &[SessionCookie],
        slot: &mut Option<CrawlSession>,
    ) -> Result<(String, ExtractionRun), CrawlError> {
        let session = match self.sessions.acquire_session(launch).await {
            Ok(session) => session,
            Err(e) => {
                let context = DiagnosticsContext::new(e.to_string()).with_url(&list.url);
                self.diagnostics
                    .capture(None, SESSION_FAILED_STAGE, &context)
                    .await;
                return Err(e.into());
            }
        };
        let session = slot.insert(session);
        let session_id = session.id.to_string();

        let page: Arc<dyn PageHandle> = match session.primary_page() {
            Some(page) => page,
            None => self.sessions.create_page(session).await.map_err(|e| {
                CrawlError::Navigation(NavigationError::Failed {
                    url: list.url.clone(),
                    last: e,
                })
            })?,
        };

        session_store::inject_into_page(page.as_ref(), cookies).await;

        if let Err(e) = self.navigation.navigate(page.as_ref(), &list.url).await {
            // Content-not-ready already captured its own bundle.
            if !matches!(e, NavigationError::ContentNotReady { .. }) {
                let context = DiagnosticsContext::new(e.to_string())
                    .with_url(&list.url)
                    .with_session(&session_id);
                self.diagnostics
                    .capture(Some(page.as_ref()), NAVIGATION_FAILED_STAGE, &context)
                    .await;
            }
            return Err(e.into());
        }

        let max_iterations = self.config.extraction.max_iterations;
        match self.extraction.run(page.as_ref(), &list.id, max_iterations).await {
            Ok(run) => Ok((session_id, run)),
            Err(e) => {
                let context = DiagnosticsContext::new(e.to_string())
                    .with_url(&list.url)
                    .with_session(&session_id);
                let page = match &e {
                    ExtractionError::PageClosed => None,
                    _ => Some(page.as_ref()),
                };
                self.diagnostics
                    .capture(page, EXTRACTION_FAILED_STAGE, &context)
                    .await;
                Err(e.into())
            }
        }
    }

    /// Close the session within the grace period. Never fails.
    async fn teardown(&self, session: Option<CrawlSession>) {
        let Some(session) = session else { return };
        let id = session.id;
        let grace = self.config.crawl.teardown_grace();
        match tokio::time::timeout(grace, session.close()).await {
            Ok(report) => {
                if report.page_errors > 0 || !report.process_closed {
                    warn!(session = %id, "teardown incomplete: {:?}", report);
                }
            }
            Err(_) => warn!(session = %id, "teardown exceeded its {:?} grace period", grace),
        }
    }

    /// Crawl several lists, at most `crawl.max_concurrent_lists` at a time.
    /// Results come back in input order.
    pub async fn run_all(&self, lists: &[SourceList]) -> Vec<(String, Result<CrawlReport, CrawlError>)> {
        let max_concurrent = self.config.crawl.max_concurrent_lists.max(1);
        info!(
            "crawling {} list(s), up to {} at a time",
            lists.len(),
            max_concurrent
        );
        stream::iter(lists)
            .map(|list| async move { (list.id.clone(), self.run(list).await) })
            .buffered(max_concurrent)
            .collect()
            .await
    }
}

