//! Forensic bundle capture for failed crawl stages.
//!
//! On a fatal navigation or extraction failure we write, next to each other
//! under the debug directory:
//! * `{stage}_{ts}.html` — the rendered markup
//! * `{stage}_{ts}.png`  — a full-page screenshot
//! * `{stage}_{ts}.json` — a summary with the triggering error, a small
//!   page-state snapshot, and the outcome of each of the other two captures
//!
//! Each part is attempted independently. Capture never fails: at minimum the
//! JSON summary is attempted even when the page is already gone.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::core::config::DiagnosticsSettings;
use crate::scraping::driver::PageHandle;
use crate::scraping::feed_profile::SNAPSHOT_SCRIPT;

/// Why diagnostics are being captured.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiagnosticsContext {
    pub error: String,
    pub url: Option<String>,
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

impl DiagnosticsContext {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Self::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_session(mut self, id: impl ToString) -> Self {
        self.session_id = Some(id.to_string());
        self
    }
}

/// Paths of whatever was written.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsBundle {
    pub summary: PathBuf,
    pub markup: Option<PathBuf>,
    pub screenshot: Option<PathBuf>,
}

#[derive(Serialize)]
struct Summary<'a> {
    stage: &'a str,
    captured_at: String,
    context: &'a DiagnosticsContext,
    snapshot: Option<Value>,
    snapshot_error: Option<String>,
    markup_file: Option<String>,
    markup_error: Option<String>,
    screenshot_file: Option<String>,
    screenshot_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DiagnosticsRecorder {
    dir: PathBuf,
    enabled: bool,
}

fn slug(stage: &str) -> String {
    let s: String = stage
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if s.is_empty() {
        "unknown".to_string()
    } else {
        s
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

impl DiagnosticsRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            enabled: true,
        }
    }

    pub fn from_settings(settings: &DiagnosticsSettings) -> Self {
        Self {
            dir: settings.resolve_dir(),
            enabled: settings.enabled,
        }
    }

    pub fn disabled() -> Self {
        Self {
            dir: PathBuf::from("."),
            enabled: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Capture a bundle for `stage`. Never fails; returns what was written.
    pub async fn capture(
        &self,
        page: Option<&dyn PageHandle>,
        stage: &str,
        context: &DiagnosticsContext,
    ) -> DiagnosticsBundle {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S-%3f").to_string();
        let base = format!("{}_{}", slug(stage), stamp);
        let summary_path = self.dir.join(format!("{}.json", base));

        if !self.enabled {
            info!("diagnostics disabled; skipping capture for stage '{}'", stage);
            return DiagnosticsBundle {
                summary: summary_path,
                ..DiagnosticsBundle::default()
            };
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(
                "diagnostics: cannot create {}: {} (continuing)",
                self.dir.display(),
                e
            );
        }

        let page = page.filter(|p| !p.is_closed());
        let unavailable = || Some("page unavailable (closed or never opened)".to_string());

        // (a) page-state snapshot
        let (snapshot, snapshot_error) = match page {
            Some(p) => match p.evaluate(SNAPSHOT_SCRIPT).await {
                Ok(v) => (Some(v), None),
                Err(e) => (None, Some(e.to_string())),
            },
            None => (None, unavailable()),
        };

        // (b) markup dump
        let markup_path = self.dir.join(format!("{}.html", base));
        let (markup, markup_error) = match page {
            Some(p) => match p.content().await {
                Ok(html) => match tokio::fs::write(&markup_path, html).await {
                    Ok(()) => (Some(markup_path), None),
                    Err(e) => (None, Some(format!("write failed: {}", e))),
                },
                Err(e) => (None, Some(e.to_string())),
            },
            None => (None, unavailable()),
        };

        // (c) screenshot
        let shot_path = self.dir.join(format!("{}.png", base));
        let (screenshot, screenshot_error) = match page {
            Some(p) => match p.screenshot().await {
                Ok(bytes) => match tokio::fs::write(&shot_path, bytes).await {
                    Ok(()) => (Some(shot_path), None),
                    Err(e) => (None, Some(format!("write failed: {}", e))),
                },
                Err(e) => (None, Some(e.to_string())),
            },
            None => (None, unavailable()),
        };

        let summary = Summary {
            stage,
            captured_at: Utc::now().to_rfc3339(),
            context,
            snapshot,
            snapshot_error,
            markup_file: markup.as_deref().map(file_name),
            markup_error,
            screenshot_file: screenshot.as_deref().map(file_name),
            screenshot_error,
        };

        match serde_json::to_vec_pretty(&summary) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&summary_path, json).await {
                    error!(
                        "diagnostics: failed to write summary {}: {}",
                        summary_path.display(),
                        e
                    );
                } else {
                    info!(
                        "diagnostics captured for stage '{}' → {}",
                        stage,
                        summary_path.display()
                    );
                }
            }
            Err(e) => error!("diagnostics: failed to serialise summary: {}", e),
        }

        DiagnosticsBundle {
            summary: summary_path,
            markup,
            screenshot,
        }
    }
}
