//! Browser-automation scraper for the anti-bot-protected documents portal.
//!
//! Disabled by default and gated behind the `browser` cargo feature. A
//! working headless browser is located at initialization; without one the
//! integration is marked unavailable in the registry instead of failing at
//! dispatch time. Anti-bot interstitials are detected in the fetched DOM
//! and reported promptly as `AntiBotChallenge` rather than hanging.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

use crate::config::ResearchConfig;
use crate::error::{Error, Result};
use crate::llm::{FieldSpec, JsonSchema, LlmGateway};
use crate::prompts::PromptStore;

use super::types::{
    Item, QueryParams, QueryResult, Question, SourceCategory, SourceError, SourceErrorKind,
    SourceMetadata,
};
use super::{generate_query_via_llm, relevant_field, Integration};

const BROWSER_BINARIES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "headless_shell",
];

const ANTI_BOT_MARKERS: &[&str] = &[
    "cf-chl",
    "challenge-platform",
    "just a moment",
    "captcha",
    "are you a robot",
];

pub struct BrowserIntegration {
    metadata: SourceMetadata,
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptStore>,
    binary: PathBuf,
    origin: String,
    timeout: Duration,
}

impl BrowserIntegration {
    pub const ID: &'static str = "documents-portal";
    const DEFAULT_ORIGIN: &'static str = "https://docs-portal.example.gov";

    pub fn new(
        gateway: &Arc<LlmGateway>,
        prompts: &Arc<PromptStore>,
        config: &ResearchConfig,
    ) -> Result<Self> {
        let binary = BROWSER_BINARIES
            .iter()
            .find_map(|name| which::which(name).ok())
            .ok_or_else(|| {
                Error::integration_init(Self::ID, "no headless browser binary found on PATH")
            })?;

        let source = config.source(Self::ID);
        Ok(Self {
            metadata: SourceMetadata::new(Self::ID, SourceCategory::BrowserScraper)
                .with_typical_latency_ms(12_000),
            gateway: Arc::clone(gateway),
            prompts: Arc::clone(prompts),
            binary,
            origin: source
                .origin
                .unwrap_or_else(|| Self::DEFAULT_ORIGIN.to_string()),
            timeout: Duration::from_secs(config.source_timeout(Self::ID)),
        })
    }

    async fn fetch_dom(&self, url: &str) -> std::result::Result<String, SourceError> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .arg("--headless")
                .arg("--disable-gpu")
                .arg("--no-sandbox")
                .arg("--dump-dom")
                .arg(url)
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| SourceError::timeout(format!("{}: browser timed out", Self::ID)))?
        .map_err(|err| SourceError::transport(format!("{}: browser spawn: {err}", Self::ID)))?;

        if !output.status.success() {
            return Err(SourceError::transport(format!(
                "{}: browser exited with {}",
                Self::ID,
                output.status
            )));
        }

        let dom = String::from_utf8_lossy(&output.stdout).into_owned();
        let lowered = dom.to_lowercase();
        if ANTI_BOT_MARKERS.iter().any(|m| lowered.contains(m)) {
            return Err(SourceError::new(
                SourceErrorKind::AntiBotChallenge,
                format!("{}: anti-bot interstitial detected", Self::ID),
            ));
        }
        Ok(dom)
    }
}

fn result_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"<a[^>]+href="(?P<href>/documents/[^"]+)"[^>]*>(?P<title>[^<]{3,200})</a>"#)
            .unwrap()
    })
}

/// Pull document links out of a portal results page.
fn extract_results(origin: &str, dom: &str, limit: usize) -> Vec<Item> {
    result_link_pattern()
        .captures_iter(dom)
        .take(limit)
        .map(|caps| {
            let href = &caps["href"];
            let title = caps["title"].trim().to_string();
            Item::new(title, format!("{origin}{href}"))
                .with_extra(json!({"dom_bytes": dom.len()}))
        })
        .collect()
}

#[async_trait]
impl Integration for BrowserIntegration {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn query_schema(&self) -> JsonSchema {
        JsonSchema::object(
            "documents_portal_query",
            vec![FieldSpec::string("query"), relevant_field()],
        )
    }

    async fn generate_query(&self, question: &Question) -> Result<Option<QueryParams>> {
        let generated = generate_query_via_llm(
            &self.gateway,
            &self.prompts,
            "query/documents_portal",
            question,
            &self.query_schema(),
        )
        .await?;

        Ok(generated.map(|mut params| {
            if params.get_str("query").map_or(true, str::is_empty) {
                params.insert(
                    "query",
                    Value::String(super::query::fallback_keywords(&question.text, 4).join(" ")),
                );
            }
            params
        }))
    }

    async fn execute_search(
        &self,
        params: &QueryParams,
        _credential: Option<&str>,
        limit: usize,
    ) -> QueryResult {
        let started = Instant::now();
        let query = params.get_str("query").unwrap_or_default();
        let url = format!(
            "{}/search?q={}",
            self.origin,
            urlencode(query)
        );
        debug!(url = %url, "scraping documents portal");

        match self.fetch_dom(&url).await {
            Ok(dom) => {
                let items = extract_results(&self.origin, &dom, limit);
                let total = items.len() as u64;
                QueryResult::ok(
                    Self::ID,
                    items,
                    total,
                    started.elapsed().as_millis() as u64,
                    Some(params.clone()),
                )
            }
            Err(error) => QueryResult::failed(
                Self::ID,
                error,
                started.elapsed().as_millis() as u64,
                Some(params.clone()),
            ),
        }
    }
}

/// Minimal percent-encoding for query strings.
fn urlencode(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            b' ' => "+".to_string(),
            other => format!("%{other:02X}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_extract_results_from_dom() {
        let dom = r#"
            <div class="results">
              <a href="/documents/2024/foia-log.pdf" class="r">FOIA log 2024</a>
              <a href="/other/nav">Navigation</a>
              <a href="/documents/2023/audit.pdf">Annual audit</a>
            </div>
        "#;
        let items = extract_results("https://portal.example", dom, 10);
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0].url,
            "https://portal.example/documents/2024/foia-log.pdf"
        );
        assert_eq!(items[0].title, "FOIA log 2024");
    }

    #[test]
    fn test_extract_results_respects_limit() {
        let dom = r#"
            <a href="/documents/a">Doc A</a>
            <a href="/documents/b">Doc B</a>
        "#;
        assert_eq!(extract_results("https://p", dom, 1).len(), 1);
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("black budget 2024"), "black+budget+2024");
        assert_eq!(urlencode("a&b"), "a%26b");
    }

    #[test]
    fn test_anti_bot_markers_match_case_insensitively() {
        let dom = "<html><title>Just a Moment...</title></html>".to_lowercase();
        assert!(ANTI_BOT_MARKERS.iter().any(|m| dom.contains(m)));
    }
}
