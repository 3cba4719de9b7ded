//! Navigation controller.
//!
//! Drives a page to the feed address in three independently retried steps:
//! full navigation, consent-dialog dismissal (best effort) and waiting until
//! at least one feed item is rendered. A page that never becomes ready gets
//! one reload before diagnostics are captured and the step fails.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::config::NavigationSettings;
use crate::core::error::{DriverError, NavigationError};
use crate::core::retry::Retry;
use crate::core::types::ActionOutcome;
use crate::features::diagnostics::{DiagnosticsContext, DiagnosticsRecorder};
use crate::scraping::driver::PageHandle;
use crate::scraping::feed_profile::FeedProfile;

/// Diagnostics stage name for a page that never became ready.
pub const NAVIGATION_FAILED_STAGE: &str = "navigation-failed";

fn classify(e: &DriverError) -> Retry {
    if e.is_closed() {
        Retry::No
    } else if e.is_transport() {
        Retry::Transport
    } else {
        Retry::Yes
    }
}

pub struct NavigationController {
    settings: NavigationSettings,
    profile: FeedProfile,
    diagnostics: DiagnosticsRecorder,
}

impl NavigationController {
    pub fn new(
        settings: NavigationSettings,
        profile: FeedProfile,
        diagnostics: DiagnosticsRecorder,
    ) -> Self {
        Self {
            settings,
            profile,
            diagnostics,
        }
    }

    /// Navigate, dismiss consent, wait for content.
    pub async fn navigate(&self, page: &dyn PageHandle, url: &str) -> Result<(), NavigationError> {
        self.goto(page, url).await?;

        match self.dismiss_consent(page).await {
            ActionOutcome::Handled => info!("consent dialog dismissed"),
            ActionOutcome::NotFound => debug!("no consent dialog present"),
            ActionOutcome::Failed => warn!("consent dialog present but could not be dismissed"),
        }

        self.wait_for_content(page, url).await
    }

    /// Full navigation with retries. A closed page fails immediately.
    pub async fn goto(&self, page: &dyn PageHandle, url: &str) -> Result<(), NavigationError> {
        if page.is_closed() {
            return Err(NavigationError::PageClosed {
                url: url.to_string(),
            });
        }

        let result = self
            .settings
            .retry
            .run("navigation", classify, |attempt| async move {
                if page.is_closed() {
                    return Err(DriverError::Closed);
                }
                debug!("navigating to {} (attempt {})", url, attempt);
                page.goto(url).await
            })
            .await;

        match result {
            Ok(()) => {
                info!("navigated to {}", url);
                Ok(())
            }
            Err(exhausted) if exhausted.last.is_closed() => Err(NavigationError::PageClosed {
                url: url.to_string(),
            }),
            Err(exhausted) => Err(NavigationError::Failed {
                url: url.to_string(),
                last: exhausted.last,
            }),
        }
    }

    /// Click an affirmative consent button if one shows up within the
    /// configured attempts. Never an error.
    pub async fn dismiss_consent(&self, page: &dyn PageHandle) -> ActionOutcome {
        let script = self.profile.consent_script();
        let attempts = self.settings.consent_attempts.max(1);
        let mut saw_failure = false;

        for attempt in 1..=attempts {
            if page.is_closed() {
                return ActionOutcome::Failed;
            }
            match page.evaluate(&script).await {
                Ok(Value::String(s)) if s == "handled" => return ActionOutcome::Handled,
                Ok(Value::String(s)) if s == "failed" => {
                    debug!("consent click failed (attempt {})", attempt);
                    saw_failure = true;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("consent probe errored (attempt {}): {}", attempt, e);
                    saw_failure = true;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(self.settings.consent_delay_ms)).await;
            }
        }

        if saw_failure {
            ActionOutcome::Failed
        } else {
            ActionOutcome::NotFound
        }
    }

    async fn content_ready(&self, page: &dyn PageHandle) -> Result<(), DriverError> {
        let script = self.profile.ready_script();
        self.settings
            .readiness_retry
            .run("content readiness", classify, |_attempt| {
                let script = script.as_str();
                async move {
                    if page.is_closed() {
                        return Err(DriverError::Closed);
                    }
                    match page.evaluate(script).await? {
                        Value::Bool(true) => Ok(()),
                        _ => Err(DriverError::Other("no feed item rendered yet".to_string())),
                    }
                }
            })
            .await
            .map_err(|exhausted| exhausted.last)
    }

    /// Wait for the first feed item; reload once as a last resort.
    pub async fn wait_for_content(
        &self,
        page: &dyn PageHandle,
        url: &str,
    ) -> Result<(), NavigationError> {
        let first = match self.content_ready(page).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_closed() => {
                return Err(NavigationError::PageClosed {
                    url: url.to_string(),
                })
            }
            Err(e) => e,
        };

        warn!("content not ready at {} ({}); reloading once", url, first);
        let last = match page.reload().await {
            Ok(()) => match self.content_ready(page).await {
                Ok(()) => {
                    info!("content ready after reload");
                    return Ok(());
                }
                Err(e) => e,
            },
            Err(e) => e,
        };

        let context = DiagnosticsContext::new(last.to_string()).with_url(url);
        let bundle = self
            .diagnostics
            .capture(Some(page), NAVIGATION_FAILED_STAGE, &context)
            .await;
        Err(NavigationError::ContentNotReady {
            url: url.to_string(),
            diagnostics: Some(bundle.summary),
        })
    }
}
