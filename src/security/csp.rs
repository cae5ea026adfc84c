//! Content-Security-Policy with a per-response nonce.
//!
//! Inline `<script>`/`<style>` tags carrying the current nonce may run; every
//! other inline script is blocked by the browser.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Deserialize;
use std::fmt;
use std::sync::RwLock;

use crate::config::CspSources;
use crate::crypto::random_hex;

pub const NONCE_BYTES: usize = 16;

static INLINE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(script|style)\b([^>]*)>").expect("valid inline tag regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nonce(String);

impl Nonce {
    pub fn generate() -> Self {
        Self(random_hex(NONCE_BYTES))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed directive set; only the fetch allow-lists come from configuration.
#[derive(Debug, Clone)]
pub struct CspPolicy {
    sources: CspSources,
    report_uri: Option<String>,
}

impl CspPolicy {
    pub fn new(sources: CspSources) -> Self {
        Self {
            sources,
            report_uri: Some("/csp-report".into()),
        }
    }

    pub fn without_reporting(mut self) -> Self {
        self.report_uri = None;
        self
    }

    pub fn header_value(&self, nonce: &Nonce) -> String {
        let nonce = format!("'nonce-{nonce}'");
        let mut directives = vec![
            "default-src 'self'".to_string(),
            format!("script-src 'self' {nonce} 'wasm-unsafe-eval'"),
            // 'unsafe-inline' stays for utility-class style attributes; browsers
            // ignore it for <style> blocks once a nonce is present.
            format!("style-src 'self' {nonce} 'unsafe-inline'"),
            with_sources("img-src", &["'self'", "data:", "blob:"], &self.sources.img_src),
            with_sources("font-src", &["'self'", "data:"], &self.sources.font_src),
            with_sources("connect-src", &["'self'"], &self.sources.connect_src),
            with_sources("frame-src", &["'self'"], &self.sources.frame_src),
            "object-src 'none'".to_string(),
            "base-uri 'self'".to_string(),
            "form-action 'self'".to_string(),
            "frame-ancestors 'none'".to_string(),
            "require-trusted-types-for 'script'".to_string(),
            "upgrade-insecure-requests".to_string(),
        ];
        if let Some(uri) = &self.report_uri {
            directives.push(format!("report-uri {uri}"));
        }
        directives.join("; ")
    }
}

fn with_sources(directive: &str, base: &[&str], extra: &[String]) -> String {
    let mut parts: Vec<&str> = vec![directive];
    parts.extend_from_slice(base);
    parts.extend(extra.iter().map(String::as_str));
    parts.join(" ")
}

/// Holds the active nonce. Shared by the response middleware; refreshed per
/// page load or on demand.
#[derive(Debug)]
pub struct CspNonceManager {
    policy: CspPolicy,
    current: RwLock<Nonce>,
}

impl CspNonceManager {
    pub fn new(policy: CspPolicy) -> Self {
        Self {
            policy,
            current: RwLock::new(Nonce::generate()),
        }
    }

    /// Generate a new nonce and make it the active one.
    pub fn refresh(&self) -> Nonce {
        let nonce = Nonce::generate();
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = nonce.clone();
        nonce
    }

    pub fn current(&self) -> Nonce {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Header value for the active nonce.
    pub fn header_value(&self) -> String {
        self.policy.header_value(&self.current())
    }

    pub fn policy(&self) -> &CspPolicy {
        &self.policy
    }
}

/// Tag every inline `<script>`/`<style>` that lacks a nonce with `nonce`.
/// Existing nonce attributes are rewritten to the current value.
pub fn apply_nonce(html: &str, nonce: &Nonce) -> String {
    static NONCE_ATTR: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r#"(?i)\snonce\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).expect("valid nonce attr regex")
    });

    INLINE_TAG
        .replace_all(html, |caps: &Captures| {
            let tag = &caps[1];
            let attrs = NONCE_ATTR.replace_all(&caps[2], "");
            let (attrs, self_closing) = match attrs.trim_end().strip_suffix('/') {
                Some(rest) => (rest.trim_end().to_string(), "/"),
                None => (attrs.trim_end().to_string(), ""),
            };
            format!(r#"<{tag}{attrs} nonce="{nonce}"{self_closing}>"#)
        })
        .into_owned()
}

/// Body of a legacy `application/csp-report` POST.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct CspViolation {
    #[serde(default)]
    pub document_uri: String,
    #[serde(default)]
    pub violated_directive: String,
    #[serde(default)]
    pub effective_directive: Option<String>,
    #[serde(default)]
    pub blocked_uri: String,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub line_number: Option<u32>,
    #[serde(default)]
    pub disposition: Option<String>,
}

#[derive(Deserialize)]
struct ReportEnvelope {
    #[serde(rename = "csp-report")]
    report: CspViolation,
}

pub fn parse_violation(body: &[u8]) -> Result<CspViolation> {
    let envelope: ReportEnvelope =
        serde_json::from_slice(body).context("invalid csp-report payload")?;
    Ok(envelope.report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CspNonceManager {
        CspNonceManager::new(CspPolicy::new(CspSources {
            img_src: vec!["https://media.licdn.com".into()],
            font_src: vec![],
            connect_src: vec!["https://api.stlouisfed.org".into()],
            frame_src: vec!["https://calendly.com".into()],
        }))
    }

    #[test]
    fn nonces_are_fresh_32_hex() {
        let a = Nonce::generate();
        let b = Nonce::generate();
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn header_tracks_latest_nonce() {
        let manager = manager();
        let first = manager.current();
        let second = manager.refresh();
        assert_ne!(first, second);

        let header = manager.header_value();
        let script = header.split("; ").find(|d| d.starts_with("script-src")).unwrap();
        let style = header.split("; ").find(|d| d.starts_with("style-src")).unwrap();
        let expected = format!("'nonce-{second}'");
        assert!(script.contains(&expected));
        assert!(style.contains(&expected));
        assert!(!header.contains(first.as_str()));
    }

    #[test]
    fn header_has_fixed_directives() {
        let header = manager().header_value();
        for directive in [
            "default-src 'self'",
            "object-src 'none'",
            "frame-ancestors 'none'",
            "require-trusted-types-for 'script'",
            "'wasm-unsafe-eval'",
            "frame-src 'self' https://calendly.com",
            "connect-src 'self' https://api.stlouisfed.org",
            "report-uri /csp-report",
        ] {
            assert!(header.contains(directive), "missing {directive}");
        }
        let quiet = CspPolicy::new(CspSources::default()).without_reporting();
        assert!(!quiet.header_value(&Nonce::generate()).contains("report-uri"));
    }

    #[test]
    fn apply_nonce_tags_inline_elements() {
        let nonce = Nonce("abc".into());
        let html = r#"<script>run()</script><style media="all">p{}</style><SCRIPT nonce='old' src="/a.js"></SCRIPT>"#;
        let tagged = apply_nonce(html, &nonce);
        assert_eq!(
            tagged,
            r#"<script nonce="abc">run()</script><style media="all" nonce="abc">p{}</style><SCRIPT src="/a.js" nonce="abc"></SCRIPT>"#
        );
    }

    #[test]
    fn parses_violation_report() {
        let body = br#"{"csp-report":{"document-uri":"https://www.example.com/","violated-directive":"script-src-elem","blocked-uri":"inline","line-number":12}}"#;
        let report = parse_violation(body).unwrap();
        assert_eq!(report.violated_directive, "script-src-elem");
        assert_eq!(report.blocked_uri, "inline");
        assert_eq!(report.line_number, Some(12));
        assert!(parse_violation(b"{}").is_err());
    }
}
