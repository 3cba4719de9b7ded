//! Site-specific knowledge, kept at arm's length.
//!
//! Everything that depends on the target site's markup lives here as
//! configurable selectors and the in-page scripts generated from them. The
//! navigation and extraction layers only ever call the script builders and
//! interpret their JSON results.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeedProfile {
    /// One element per feed item.
    pub item_selector: String,
    /// Anchor inside an item whose `href` is the permalink.
    pub permalink_selector: String,
    /// Element inside an item holding the body text.
    pub body_selector: String,
    /// Visible labels of "see more" affordances that expand truncated bodies.
    pub expand_labels: Vec<String>,
    /// Affirmative labels on cookie/consent dialogs, across locales.
    pub consent_labels: Vec<String>,
    /// Query parameters stripped from permalinks (exact names or `prefix*`).
    pub tracking_params: Vec<String>,
}

impl Default for FeedProfile {
    fn default() -> Self {
        Self {
            item_selector: "[role='feed'] [role='article'], div[data-pagelet^='FeedUnit']"
                .to_string(),
            permalink_selector:
                "a[href*='/posts/'], a[href*='/permalink/'], a[href*='story_fbid'], a[href*='/p/']"
                    .to_string(),
            body_selector: "[data-ad-preview='message'], [data-ad-comet-preview='message'], div[dir='auto']"
                .to_string(),
            expand_labels: vec![
                "See more".into(),
                "Voir plus".into(),
                "Mehr anzeigen".into(),
                "Ver más".into(),
                "Mostra altro".into(),
                "Ver mais".into(),
            ],
            consent_labels: vec![
                "Allow all cookies".into(),
                "Accept all".into(),
                "Accept All".into(),
                "Only allow essential cookies".into(),
                "Tout accepter".into(),
                "Autoriser tous les cookies".into(),
                "Alle akzeptieren".into(),
                "Alle Cookies erlauben".into(),
                "Aceptar todo".into(),
                "Permitir todas las cookies".into(),
                "Accetta tutto".into(),
                "Aceitar tudo".into(),
            ],
            tracking_params: vec![
                "__cft__*".into(),
                "__tn__".into(),
                "utm_*".into(),
                "ref".into(),
                "refid".into(),
                "fbclid".into(),
            ],
        }
    }
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn js_string_array(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

impl FeedProfile {
    /// Script returning `[{key, body}, ...]` for every rendered item.
    pub fn read_items_script(&self) -> String {
        format!(
            r#"(() => {{
    const items = Array.from(document.querySelectorAll({items}));
    return items.map((el) => {{
        const link = el.querySelector({link});
        const bodyEl = el.querySelector({body});
        return {{
            key: link ? link.href : null,
            body: bodyEl ? bodyEl.innerText : null,
        }};
    }});
}})()"#,
            items = js_string(&self.item_selector),
            link = js_string(&self.permalink_selector),
            body = js_string(&self.body_selector),
        )
    }

    /// Script clicking every visible "see more" affordance; returns the click count.
    pub fn expand_script(&self) -> String {
        format!(
            r#"(() => {{
    const labels = new Set({labels});
    let clicked = 0;
    for (const el of document.querySelectorAll("div[role='button'], span[role='button'], a, button")) {{
        const text = (el.innerText || '').trim();
        if (!labels.has(text)) continue;
        const rect = el.getBoundingClientRect();
        if (rect.width === 0 || rect.height === 0) continue;
        try {{ el.click(); clicked++; }} catch (e) {{}}
    }}
    return clicked;
}})()"#,
            labels = js_string_array(&self.expand_labels),
        )
    }

    /// Script returning `true` once at least one extractable item is rendered.
    pub fn ready_script(&self) -> String {
        format!(
            "document.querySelectorAll({}).length > 0",
            js_string(&self.item_selector)
        )
    }

    /// Script clicking the first affirmative consent button.
    ///
    /// Returns `"handled"`, `"not_found"` or `"failed"`.
    pub fn consent_script(&self) -> String {
        format!(
            r#"(() => {{
    const labels = {labels};
    const candidates = Array.from(document.querySelectorAll("button, div[role='button'], [aria-label]"));
    for (const label of labels) {{
        const el = candidates.find((c) =>
            (c.innerText || '').trim() === label || c.getAttribute('aria-label') === label);
        if (!el) continue;
        try {{ el.click(); return 'handled'; }} catch (e) {{ return 'failed'; }}
    }}
    return 'not_found';
}})()"#,
            labels = js_string_array(&self.consent_labels),
        )
    }

    /// Strip fragments and tracking parameters so one item has one key.
    pub fn canonical_key(&self, raw: &str) -> Option<String> {
        let mut url = url::Url::parse(raw.trim()).ok()?;
        url.set_fragment(None);
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !self.is_tracking_param(k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }
        let mut key = url.to_string();
        if key.ends_with('/') && url.path() != "/" {
            key.pop();
        }
        Some(key)
    }

    fn is_tracking_param(&self, name: &str) -> bool {
        self.tracking_params.iter().any(|p| match p.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == p,
        })
    }
}

/// Script scrolling the window by `px` pixels.
pub fn scroll_script(px: u32) -> String {
    format!("window.scrollBy({{top: {}, behavior: 'smooth'}});", px)
}

/// Small page-state snapshot used by diagnostics.
pub const SNAPSHOT_SCRIPT: &str = r#"(() => ({
    url: location.href,
    title: document.title,
    ready_state: document.readyState,
    body_length: document.body ? document.body.innerHTML.length : 0,
}))()"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_key_strips_tracking_and_fragment() {
        let p = FeedProfile::default();
        assert_eq!(
            p.canonical_key("https://site.test/groups/1/posts/42/?__cft__[0]=abc&__tn__=R#c").unwrap(),
            "https://site.test/groups/1/posts/42"
        );
        assert_eq!(
            p.canonical_key("https://site.test/permalink.php?story_fbid=7&id=9&utm_source=x").unwrap(),
            "https://site.test/permalink.php?story_fbid=7&id=9"
        );
        assert!(p.canonical_key("not a url").is_none());
    }

    #[test]
    fn scripts_embed_selectors_as_json_strings() {
        let p = FeedProfile {
            item_selector: "div[data-x='a\"b']".into(),
            ..FeedProfile::default()
        };
        let script = p.read_items_script();
        assert!(script.contains(r#""div[data-x='a\"b']""#));
        assert!(p.ready_script().starts_with("document.querySelectorAll("));
    }
}
