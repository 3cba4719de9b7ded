//! `chromiumoxide` implementation of the driver traits.
//!
//! This module is the only place that touches CDP types:
//! * Finding a usable browser executable (Chrome → Chromium → Brave, cross-platform).
//! * Building the launch config with stealth defaults.
//! * Running the CDP handler loop and surfacing disconnects.
//! * Per-page wiring: operation timeout, script-error and failed-request
//!   logging, proxy credential answering via the `Fetch` domain.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::fetch::{
    AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
    ContinueWithAuthParams, EnableParams, EventAuthRequired, EventRequestPaused,
};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EventLoadingFailed, SetCookiesParams,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::EventExceptionThrown;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use rand::seq::IndexedRandom;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::error::DriverError;
use crate::core::types::ProxyCredentials;
use crate::features::session_store::SessionCookie;
use crate::scraping::driver::{BrowserDriver, BrowserProcess, LaunchConfig, PageHandle, PageSetup};

// ── Realistic User-Agent pool ────────────────────────────────────────────────

const DESKTOP_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 Edg/132.0.0.0",
];

/// Returns a randomly-chosen Chromium-family desktop User-Agent string.
pub fn random_user_agent() -> &'static str {
    let mut rng = rand::rng();
    DESKTOP_USER_AGENTS
        .choose(&mut rng)
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0])
}

// ── Browser executable discovery ─────────────────────────────────────────────

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. `CHROME_EXECUTABLE` env var (explicit override)
/// 2. PATH scan
/// 3. OS-specific well-known install paths
pub fn find_chrome_executable() -> Option<String> {
    if let Some(p) = crate::core::config::chrome_executable_override() {
        return Some(p);
    }

    if let Ok(path_var) = std::env::var("PATH") {
        let candidates = [
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
            "chrome",
            "brave-browser",
        ];
        for dir in std::env::split_paths(&path_var) {
            for exe in candidates {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/local/bin/chromium",
            "/snap/bin/chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

// ── Launch config builder ────────────────────────────────────────────────────

/// Build a `BrowserConfig` with stealth defaults.
///
/// `--disable-blink-features=AutomationControlled` hides `navigator.webdriver`;
/// the sandbox / shm flags keep Chromium alive in containers.
pub fn build_browser_config(exe: &str, launch: &LaunchConfig) -> Result<BrowserConfig, DriverError> {
    let ua = random_user_agent();

    let mut builder = BrowserConfig::builder()
        .chrome_executable(exe)
        .request_timeout(launch.operation_timeout)
        .viewport(Viewport {
            width: launch.width,
            height: launch.height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(launch.width, launch.height)
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--disable-sync")
        .arg("--disable-translate")
        .arg("--disable-notifications")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--mute-audio")
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={}", ua));

    if !launch.headless {
        builder = builder.with_head();
    }
    if let Some(proxy) = &launch.proxy {
        builder = builder.arg(format!("--proxy-server={}", proxy.server_url()));
    }
    if let Some(dir) = &launch.user_data_dir {
        builder = builder.user_data_dir(dir);
    }
    for arg in &launch.extra_args {
        builder = builder.arg(arg.as_str());
    }

    builder
        .build()
        .map_err(|e| DriverError::Launch(format!("invalid browser config: {}", e)))
}

// ── Driver ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct ChromiumDriver;

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn launch(&self, config: &LaunchConfig) -> Result<Box<dyn BrowserProcess>, DriverError> {
        let exe = config
            .executable
            .clone()
            .or_else(find_chrome_executable)
            .ok_or_else(|| {
                DriverError::Launch(
                    "no browser found; install Chrome or Chromium or set CHROME_EXECUTABLE"
                        .to_string(),
                )
            })?;

        info!("launching browser ({})", exe);
        let browser_config = build_browser_config(&exe, config)?;
        let (browser, mut handler) = Browser::launch(browser_config).await.map_err(|e| {
            let err = DriverError::from_message("launch", e);
            match err {
                DriverError::Protocol(_) => err,
                other => DriverError::Launch(other.to_string()),
            }
        })?;

        let connected = Arc::new(AtomicBool::new(true));
        let flag = connected.clone();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("CDP handler error: {}", e);
                }
            }
            flag.store(false, Ordering::SeqCst);
            warn!("browser disconnected (CDP event stream ended)");
        });

        Ok(Box::new(ChromiumProcess {
            browser,
            handler_task,
            connected,
            operation_timeout: config.operation_timeout,
        }))
    }
}

pub struct ChromiumProcess {
    browser: Browser,
    handler_task: JoinHandle<()>,
    connected: Arc<AtomicBool>,
    operation_timeout: Duration,
}

#[async_trait]
impl BrowserProcess for ChromiumProcess {
    async fn new_page(&self, setup: &PageSetup) -> Result<Arc<dyn PageHandle>, DriverError> {
        if !self.is_connected() {
            return Err(DriverError::Closed);
        }
        let timeout = setup.operation_timeout.unwrap_or(self.operation_timeout);
        let page = tokio::time::timeout(timeout, self.browser.new_page("about:blank"))
            .await
            .map_err(|_| DriverError::Timeout(timeout))?
            .map_err(|e| DriverError::from_message("new_page", e))?;

        let handle = ChromiumPage {
            page,
            timeout,
            closed: Arc::new(AtomicBool::new(false)),
            process_connected: self.connected.clone(),
        };
        handle.wire_logging().await;
        if let Some(creds) = &setup.proxy_credentials {
            handle.wire_proxy_auth(creds.clone()).await?;
        }
        Ok(Arc::new(handle))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        let result = self
            .browser
            .close()
            .await
            .map(|_| ())
            .map_err(|e| DriverError::from_message("browser close", e));
        if result.is_ok() {
            if let Err(e) = self.browser.wait().await {
                debug!("browser wait after close: {}", e);
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        self.handler_task.abort();
        result
    }
}

pub struct ChromiumPage {
    page: Page,
    timeout: Duration,
    closed: Arc<AtomicBool>,
    process_connected: Arc<AtomicBool>,
}

impl ChromiumPage {
    async fn guarded<T, F>(&self, what: &str, fut: F) -> Result<T, DriverError>
    where
        F: std::future::Future<Output = Result<T, chromiumoxide::error::CdpError>>,
    {
        if self.is_closed() {
            return Err(DriverError::Closed);
        }
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(DriverError::from_message(what, e)),
            Err(_) => Err(DriverError::Timeout(self.timeout)),
        }
    }

    /// Log uncaught in-page script errors and failed sub-resource requests.
    async fn wire_logging(&self) {
        match self.page.event_listener::<EventExceptionThrown>().await {
            Ok(mut events) => {
                tokio::spawn(async move {
                    while let Some(ev) = events.next().await {
                        let detail = ev
                            .exception_details
                            .exception
                            .as_ref()
                            .and_then(|e| e.description.clone())
                            .unwrap_or_else(|| ev.exception_details.text.clone());
                        warn!("page script error: {}", detail);
                    }
                });
            }
            Err(e) => debug!("could not subscribe to script errors: {}", e),
        }

        match self.page.event_listener::<EventLoadingFailed>().await {
            Ok(mut events) => {
                tokio::spawn(async move {
                    while let Some(ev) = events.next().await {
                        if ev.canceled.unwrap_or(false) {
                            continue;
                        }
                        debug!("request failed ({:?}): {}", ev.r#type, ev.error_text);
                    }
                });
            }
            Err(e) => debug!("could not subscribe to failed requests: {}", e),
        }
    }

    /// Answer proxy auth challenges. Registered before any navigation.
    async fn wire_proxy_auth(&self, creds: ProxyCredentials) -> Result<(), DriverError> {
        let mut auth_events = self
            .page
            .event_listener::<EventAuthRequired>()
            .await
            .map_err(|e| DriverError::from_message("fetch auth listener", e))?;
        let mut paused_events = self
            .page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(|e| DriverError::from_message("fetch pause listener", e))?;

        let page = self.page.clone();
        tokio::spawn(async move {
            while let Some(ev) = auth_events.next().await {
                let response = AuthChallengeResponse {
                    response: AuthChallengeResponseResponse::ProvideCredentials,
                    username: Some(creds.username.clone()),
                    password: Some(creds.password.clone()),
                };
                if let Err(e) = page
                    .execute(ContinueWithAuthParams::new(ev.request_id.clone(), response))
                    .await
                {
                    warn!("proxy auth response failed: {}", e);
                }
            }
        });

        let page = self.page.clone();
        tokio::spawn(async move {
            while let Some(ev) = paused_events.next().await {
                if let Err(e) = page
                    .execute(ContinueRequestParams::new(ev.request_id.clone()))
                    .await
                {
                    debug!("continue paused request failed: {}", e);
                }
            }
        });

        self.guarded(
            "fetch enable",
            self.page.execute(EnableParams {
                patterns: None,
                handle_auth_requests: Some(true),
            }),
        )
        .await?;
        info!("proxy credentials registered on page");
        Ok(())
    }
}

fn cookie_params(cookies: &[SessionCookie]) -> Vec<CookieParam> {
    cookies
        .iter()
        .filter_map(|c| {
            let mut v = json!({
                "name": c.name,
                "value": c.value,
            });
            if let Some(obj) = v.as_object_mut() {
                if let Some(d) = &c.domain {
                    obj.insert("domain".into(), json!(d));
                }
                obj.insert("path".into(), json!(c.path.clone().unwrap_or_else(|| "/".into())));
                if let Some(s) = c.secure {
                    obj.insert("secure".into(), json!(s));
                }
                if let Some(h) = c.http_only {
                    obj.insert("httpOnly".into(), json!(h));
                }
                if let Some(ss) = c.normalized_same_site() {
                    obj.insert("sameSite".into(), json!(ss));
                }
                if let Some(exp) = c.expires.filter(|e| *e > 0.0) {
                    obj.insert("expires".into(), json!(exp));
                }
            }
            serde_json::from_value::<CookieParam>(v).ok()
        })
        .collect()
}

#[async_trait]
impl PageHandle for ChromiumPage {
    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        self.guarded("goto", self.page.goto(url)).await.map(|_| ())
    }

    async fn reload(&self) -> Result<(), DriverError> {
        self.guarded("reload", self.page.reload()).await.map(|_| ())
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        let result = self
            .guarded("evaluate", self.page.evaluate(script))
            .await
            .map_err(|e| match e {
                DriverError::Other(msg) => DriverError::Evaluation(msg),
                other => other,
            })?;
        Ok(result.into_value::<Value>().unwrap_or(Value::Null))
    }

    async fn content(&self) -> Result<String, DriverError> {
        self.guarded("content", self.page.content()).await
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        self.guarded("screenshot", self.page.screenshot(params)).await
    }

    async fn set_cookies(&self, cookies: &[SessionCookie]) -> Result<usize, DriverError> {
        let params = cookie_params(cookies);
        if params.is_empty() {
            return Ok(0);
        }
        let count = params.len();
        self.guarded("set_cookies", self.page.execute(SetCookiesParams::new(params)))
            .await?;
        Ok(count)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.process_connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), DriverError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.page
            .clone()
            .close()
            .await
            .map_err(|e| DriverError::from_message("page close", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookies_convert_to_cdp_params() {
        let cookies = vec![
            SessionCookie {
                name: "c_user".into(),
                value: "1001".into(),
                domain: Some(".site.test".into()),
                path: None,
                secure: Some(true),
                http_only: Some(true),
                same_site: Some("no_restriction".into()),
                expires: Some(-1.0),
            },
            SessionCookie {
                name: "xs".into(),
                value: "abc".into(),
                domain: Some(".site.test".into()),
                path: Some("/".into()),
                secure: None,
                http_only: None,
                same_site: Some("lax".into()),
                expires: Some(1_900_000_000.0),
            },
        ];
        let params = cookie_params(&cookies);
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name, "c_user");
        assert_eq!(params[0].path.as_deref(), Some("/"));
    }

    #[test]
    fn user_agent_is_from_pool() {
        assert!(DESKTOP_USER_AGENTS.contains(&random_user_agent()));
    }
}
