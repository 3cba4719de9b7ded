// proxy_preflight.rs - fail fast on a dead upstream proxy
// Runs config → TCP → proxied request checks before any browser is launched.
// No retries: a failure here is final for the crawl.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::core::config::ProxySettings;
use crate::core::types::{
    PreflightStage, ProxyDescriptor, ProxyParseError, ProxyValidationResult,
};

const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "socks5", "socks5h"];

#[derive(Debug, Clone)]
pub struct ProxyPreflightValidator {
    probe_target: String,
    tcp_timeout: Duration,
    request_timeout: Duration,
    required: bool,
}

impl ProxyPreflightValidator {
    pub fn new(probe_target: impl Into<String>) -> Self {
        Self {
            probe_target: probe_target.into(),
            tcp_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            required: false,
        }
    }

    pub fn from_settings(settings: &ProxySettings) -> Self {
        Self {
            probe_target: settings.probe_target.clone(),
            tcp_timeout: Duration::from_millis(settings.tcp_timeout_ms),
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            required: settings.required,
        }
    }

    pub fn with_timeouts(mut self, tcp: Duration, request: Duration) -> Self {
        self.tcp_timeout = tcp;
        self.request_timeout = request;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Same as [`validate`](Self::validate), for the outcome of
    /// [`ProxySettings::resolve`]: an address that did not parse fails at config.
    pub async fn validate_configured(
        &self,
        configured: &Result<Option<ProxyDescriptor>, ProxyParseError>,
    ) -> ProxyValidationResult {
        match configured {
            Ok(proxy) => self.validate(proxy.as_ref()).await,
            Err(e) => {
                warn!("preflight: {}", e);
                ProxyValidationResult::failed(PreflightStage::Config, e.to_string())
            }
        }
    }

    /// Check `proxy` and report the last stage reached.
    pub async fn validate(&self, proxy: Option<&ProxyDescriptor>) -> ProxyValidationResult {
        let Some(proxy) = proxy else {
            if self.required {
                warn!("preflight: a proxy is required but none is configured");
                return ProxyValidationResult::failed(
                    PreflightStage::Config,
                    "proxy required but not configured",
                );
            }
            info!("preflight: no proxy configured, skipping");
            return ProxyValidationResult::passed(PreflightStage::None);
        };

        let masked = proxy.masked();

        // (1) config
        let port = match check_config(proxy) {
            Ok(port) => port,
            Err(reason) => {
                warn!("preflight: proxy {} rejected at config stage: {}", masked, reason);
                return ProxyValidationResult::failed(PreflightStage::Config, reason);
            }
        };

        // (2) tcp
        let started = Instant::now();
        match tokio::time::timeout(self.tcp_timeout, TcpStream::connect((proxy.host.as_str(), port))).await {
            Ok(Ok(_stream)) => {}
            Ok(Err(e)) => {
                warn!("preflight: TCP connect to {} failed: {}", masked, e);
                return ProxyValidationResult::failed(
                    PreflightStage::Tcp,
                    format!("connect to {}:{} failed: {}", proxy.host, port, e),
                );
            }
            Err(_) => {
                warn!(
                    "preflight: TCP connect to {} timed out after {:?}",
                    masked, self.tcp_timeout
                );
                return ProxyValidationResult::failed(
                    PreflightStage::Tcp,
                    format!("connect to {}:{} timed out after {:?}", proxy.host, port, self.tcp_timeout),
                );
            }
        }

        // (3) one request through the proxy
        let mut result = self.probe(proxy).await;
        result.latency_ms = Some(started.elapsed().as_millis() as u64);
        if result.success {
            info!(
                "preflight: proxy {} OK -> {} in {}ms",
                masked,
                self.probe_target,
                result.latency_ms.unwrap_or_default()
            );
        } else {
            warn!(
                "preflight: proxy {} failed probe request: {}",
                masked,
                result.error.as_deref().unwrap_or("unknown")
            );
        }
        result
    }

    async fn probe(&self, proxy: &ProxyDescriptor) -> ProxyValidationResult {
        let mut rp = match reqwest::Proxy::all(proxy.server_url()) {
            Ok(p) => p,
            Err(e) => {
                return ProxyValidationResult::failed(
                    PreflightStage::Config,
                    format!("invalid proxy URL: {}", e),
                )
            }
        };
        if let Some(creds) = proxy.credentials() {
            rp = rp.basic_auth(&creds.username, &creds.password);
        }

        let client = match reqwest::Client::builder()
            .proxy(rp)
            .timeout(self.request_timeout)
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                return ProxyValidationResult::failed(
                    PreflightStage::Proxy,
                    format!("failed to build proxy client: {}", e),
                )
            }
        };

        match client.get(&self.probe_target).send().await {
            Ok(resp) => {
                let status = resp.status();
                let mut result = if status.is_success() {
                    ProxyValidationResult::passed(PreflightStage::Proxy)
                } else {
                    ProxyValidationResult::failed(
                        PreflightStage::Proxy,
                        describe_status(status.as_u16()),
                    )
                };
                result.http_status = Some(status.as_u16());
                result
            }
            Err(e) => {
                let mut result = ProxyValidationResult::failed(
                    PreflightStage::Proxy,
                    format!("request through proxy failed: {}", e),
                );
                result.http_status = e.status().map(|s| s.as_u16());
                result
            }
        }
    }
}

fn check_config(proxy: &ProxyDescriptor) -> Result<u16, String> {
    if proxy.host.trim().is_empty() {
        return Err("proxy host is missing".to_string());
    }
    let port = proxy.port.ok_or_else(|| "proxy port is missing".to_string())?;
    if port == 0 {
        return Err("proxy port must be non-zero".to_string());
    }
    if !SUPPORTED_SCHEMES.contains(&proxy.scheme.as_str()) {
        return Err(format!("unsupported proxy scheme '{}'", proxy.scheme));
    }
    Ok(port)
}

fn describe_status(status: u16) -> String {
    match status {
        407 => "proxy authentication required (407)".to_string(),
        502 => "proxy could not reach upstream (502)".to_string(),
        other => format!("probe returned HTTP {}", other),
    }
}

/// Mask proxy credentials for logging
pub fn mask_proxy_credentials(url: &str) -> String {
    match ProxyDescriptor::from_url(url) {
        Ok(d) if d.username.is_some() => d.masked(),
        Ok(_) => url.to_string(),
        Err(e) => e.masked,
    }
}
