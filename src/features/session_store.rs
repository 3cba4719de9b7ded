//! Session credential store — load saved cookies and inject them into a page.
//!
//! A logged-in browser session is exported once (outside this tool) as a JSON
//! array of `{name, value, domain, path, secure, sameSite}` records. Before
//! navigating, the crawl loads that file and injects the cookies so the feed
//! renders in an authenticated state. The file is read-only input here.
//!
//! Lookup order for the file: explicit path from config, then
//! `~/.feed-harvester/sessions/{domain_key}.json` for the target address,
//! then the parent domain's file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::error::CredentialError;
use crate::scraping::driver::PageHandle;

/// One stored cookie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: Option<bool>,
    #[serde(default)]
    pub http_only: Option<bool>,
    #[serde(default)]
    pub same_site: Option<String>,
    /// Unix seconds; `-1` or absent for session cookies.
    #[serde(default)]
    pub expires: Option<f64>,
}

impl SessionCookie {
    /// `sameSite` normalised to the CDP spelling (`Strict` / `Lax` / `None`).
    pub fn normalized_same_site(&self) -> Option<&'static str> {
        match self.same_site.as_deref()?.to_ascii_lowercase().as_str() {
            "strict" => Some("Strict"),
            "lax" => Some("Lax"),
            "none" | "no_restriction" | "unspecified" => Some("None"),
            _ => None,
        }
    }

    pub fn is_expired(&self, now_unix: f64) -> bool {
        matches!(self.expires, Some(exp) if exp > 0.0 && exp < now_unix)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Domain key utilities
// ─────────────────────────────────────────────────────────────────────────────

fn host_to_key(host: &str) -> String {
    host.replace(['.', ':'], "_")
}

/// Filesystem-safe key for the host of `url`.
///
/// e.g. `https://www.site.test/groups/1` → `"www_site_test"`
pub fn domain_key(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(host_to_key))
}

/// Key for the parent domain, or `None` for a bare second-level domain.
///
/// * `"www.site.test"` → `Some("site_test")`
/// * `"site.test"`     → `None`
pub fn parent_domain_key(host: &str) -> Option<String> {
    let dot_pos = host.find('.')?;
    let rest = &host[dot_pos + 1..];
    if rest.contains('.') {
        Some(host_to_key(rest))
    } else {
        None
    }
}

fn sessions_dir() -> Option<PathBuf> {
    Some(dirs::home_dir()?.join(".feed-harvester").join("sessions"))
}

/// Candidate cookie files for `url`, most specific first.
pub fn default_paths(url: &str) -> Vec<PathBuf> {
    let Some(dir) = sessions_dir() else {
        return Vec::new();
    };
    let Some(host) = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
    else {
        return Vec::new();
    };
    let mut paths = vec![dir.join(format!("{}.json", host_to_key(&host)))];
    if let Some(parent) = parent_domain_key(&host) {
        paths.push(dir.join(format!("{}.json", parent)));
    }
    paths
}

// ─────────────────────────────────────────────────────────────────────────────
// Load
// ─────────────────────────────────────────────────────────────────────────────

/// Read and parse one cookie file.
///
/// Individual malformed entries are skipped; an unreadable or non-array file
/// is an error.
pub fn load_file(path: &Path) -> Result<Vec<SessionCookie>, CredentialError> {
    if !path.exists() {
        return Err(CredentialError::Missing(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path).map_err(|e| CredentialError::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let raw: Vec<serde_json::Value> =
        serde_json::from_str(&text).map_err(|e| CredentialError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let total = raw.len();
    let cookies: Vec<SessionCookie> = raw
        .into_iter()
        .filter_map(|v| serde_json::from_value::<SessionCookie>(v).ok())
        .collect();
    if cookies.len() < total {
        warn!(
            "session_store: skipped {} malformed cookie record(s) in {}",
            total - cookies.len(),
            path.display()
        );
    }

    let now = chrono::Utc::now().timestamp() as f64;
    let expired = cookies.iter().filter(|c| c.is_expired(now)).count();
    if expired > 0 {
        warn!(
            "session_store: {} of {} cookies in {} are already expired; the session may need a fresh export",
            expired,
            cookies.len(),
            path.display()
        );
    }

    info!(
        "session_store: loaded {} cookies from {}",
        cookies.len(),
        path.display()
    );
    Ok(cookies)
}

/// Resolve and load cookies for a crawl of `url`.
///
/// An explicit path (config or env) must exist. Without one the per-domain
/// defaults are tried, and their absence is only an error when `required`.
pub fn load_for(
    explicit: Option<&Path>,
    url: &str,
    required: bool,
) -> Result<Vec<SessionCookie>, CredentialError> {
    if let Some(path) = explicit {
        return load_file(path);
    }

    let candidates = default_paths(url);
    for path in &candidates {
        if path.exists() {
            return load_file(path);
        }
    }
    if required {
        let first = candidates
            .into_iter()
            .next()
            .unwrap_or_else(|| PathBuf::from("cookies.json"));
        return Err(CredentialError::Missing(first));
    }
    Ok(Vec::new())
}

// ─────────────────────────────────────────────────────────────────────────────
// Inject
// ─────────────────────────────────────────────────────────────────────────────

/// Inject cookies into a page **before** navigation.
///
/// Returns the number accepted. Injection failure is logged, not raised: a
/// crawl without cookies still produces diagnostics about the login wall.
pub async fn inject_into_page(page: &dyn PageHandle, cookies: &[SessionCookie]) -> usize {
    if cookies.is_empty() {
        return 0;
    }
    match page.set_cookies(cookies).await {
        Ok(count) => {
            info!("session_store: injected {} session cookies", count);
            count
        }
        Err(e) => {
            warn!("session_store: failed to inject session cookies: {}", e);
            0
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_cookies_and_skips_malformed() {
        let f = write_tmp(
            r#"[
                {"name": "c_user", "value": "1001", "domain": ".site.test", "path": "/", "secure": true, "sameSite": "no_restriction"},
                {"value": "missing name"},
                {"name": "xs", "value": "abc", "sameSite": "Lax", "expires": -1}
            ]"#,
        );
        let cookies = load_file(f.path()).unwrap();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].normalized_same_site(), Some("None"));
        assert_eq!(cookies[1].normalized_same_site(), Some("Lax"));
    }

    #[test]
    fn explicit_missing_file_is_error_even_when_optional() {
        let missing = Path::new("/no/such/cookies.json");
        for required in [true, false] {
            assert!(matches!(
                load_for(Some(missing), "https://site.test", required),
                Err(CredentialError::Missing(_))
            ));
        }
    }

    #[test]
    fn absent_domain_default_is_only_fatal_when_required() {
        let url = "https://nowhere-7f3a.invalid";
        assert!(load_for(None, url, false).unwrap().is_empty());
        if default_paths(url).iter().all(|p| !p.exists()) {
            assert!(matches!(
                load_for(None, url, true),
                Err(CredentialError::Missing(_))
            ));
        }
    }

    #[test]
    fn non_array_file_is_unreadable() {
        let f = write_tmp(r#"{"cookies": []}"#);
        assert!(matches!(
            load_file(f.path()),
            Err(CredentialError::Unreadable { .. })
        ));
    }

    #[test]
    fn expired_detection() {
        let c = SessionCookie {
            name: "a".into(),
            value: "b".into(),
            domain: None,
            path: None,
            secure: None,
            http_only: None,
            same_site: None,
            expires: Some(100.0),
        };
        assert!(c.is_expired(200.0));
        assert!(!c.is_expired(50.0));
    }

    #[test]
    fn domain_keys() {
        assert_eq!(
            domain_key("https://www.site.test/groups/1"),
            Some("www_site_test".into())
        );
        assert_eq!(parent_domain_key("www.site.test"), Some("site_test".into()));
        assert!(parent_domain_key("site.test").is_none());
    }
}
