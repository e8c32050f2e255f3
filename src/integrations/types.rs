//! Types crossing the integration boundary.
//!
//! Everything an integration produces is a value: expected upstream
//! failures are recorded on [`QueryResult`] rather than raised, so the
//! dispatch layer and the engine only ever see data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The user's research question, immutable for the life of a run.
///
/// During dispatch each subtask is wrapped as its own `Question` carrying
/// the run's sensitivity, so integrations see one focused query at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    /// Caller-supplied tag; when absent the engine classifies the text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<Sensitivity>,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sensitivity: None,
        }
    }

    pub fn with_sensitivity(mut self, sensitivity: Sensitivity) -> Self {
        self.sensitivity = Some(sensitivity);
        self
    }
}

/// Question sensitivity classification. Sensitive questions get a lower
/// relevance threshold: classified topics produce indirect evidence that
/// scores low but is the best available signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Public,
    Sensitive,
}

impl std::fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Sensitive => write!(f, "sensitive"),
        }
    }
}

/// Broad source family, used for selection biasing and follow-up policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    Government,
    Social,
    WebSearch,
    LocalArchive,
    BrowserScraper,
}

impl std::fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Government => "government",
            Self::Social => "social",
            Self::WebSearch => "web_search",
            Self::LocalArchive => "local_archive",
            Self::BrowserScraper => "browser_scraper",
        };
        write!(f, "{s}")
    }
}

/// Static description of an integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub id: String,
    pub category: SourceCategory,
    pub requires_credential: bool,
    /// Default environment variable holding the credential; config can
    /// override per source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_env_name: Option<String>,
    /// Rough upstream cost per query in USD, for selection prompts.
    pub cost_estimate_per_query: f64,
    pub typical_latency_ms: u64,
}

impl SourceMetadata {
    pub fn new(id: impl Into<String>, category: SourceCategory) -> Self {
        Self {
            id: id.into(),
            category,
            requires_credential: false,
            credential_env_name: None,
            cost_estimate_per_query: 0.0,
            typical_latency_ms: 1_000,
        }
    }

    pub fn with_credential(mut self, env_name: impl Into<String>) -> Self {
        self.requires_credential = true;
        self.credential_env_name = Some(env_name.into());
        self
    }

    pub fn with_cost_estimate(mut self, usd: f64) -> Self {
        self.cost_estimate_per_query = usd;
        self
    }

    pub fn with_typical_latency_ms(mut self, ms: u64) -> Self {
        self.typical_latency_ms = ms;
        self
    }
}

/// Integration-specific query parameters, validated against the
/// integration's schema at generation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryParams(pub Map<String, Value>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a validated JSON object; `None` for non-objects.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_str_array(&self, key: &str) -> Vec<String> {
        self.0
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// Why a source-level operation failed. These are expected conditions, not
/// bugs; each maps to a limitation note rather than a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceErrorKind {
    RateLimited,
    Timeout,
    AntiBotChallenge,
    UpstreamMalformed,
    MissingCredential,
    QueryGenOptOut,
    QueryGenFailed,
    Transport,
}

impl std::fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::AntiBotChallenge => "anti_bot_challenge",
            Self::UpstreamMalformed => "upstream_malformed",
            Self::MissingCredential => "missing_credential",
            Self::QueryGenOptOut => "query_gen_opt_out",
            Self::QueryGenFailed => "query_gen_failed",
            Self::Transport => "transport",
        };
        write!(f, "{s}")
    }
}

/// A source-level failure value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn new(kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::RateLimited, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Timeout, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::UpstreamMalformed, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Transport, message)
    }
}

/// One normalized search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub title: String,
    /// Unique within a run's accepted set; the dedupe key.
    pub url: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Raw upstream payload, preserved for provenance.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

impl Item {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            description: String::new(),
            date: None,
            author: None,
            extra: Value::Null,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }
}

/// The result of one logical query against one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,
    pub source_id: String,
    pub items: Vec<Item>,
    /// Total the upstream claims to have, not what was fetched.
    pub total_reported: u64,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SourceError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_params: Option<QueryParams>,
}

impl QueryResult {
    pub fn ok(
        source_id: impl Into<String>,
        items: Vec<Item>,
        total_reported: u64,
        response_time_ms: u64,
        query_params: Option<QueryParams>,
    ) -> Self {
        Self {
            success: true,
            source_id: source_id.into(),
            items,
            total_reported,
            response_time_ms,
            error: None,
            query_params,
        }
    }

    pub fn failed(
        source_id: impl Into<String>,
        error: SourceError,
        response_time_ms: u64,
        query_params: Option<QueryParams>,
    ) -> Self {
        Self {
            success: false,
            source_id: source_id.into(),
            items: Vec::new(),
            total_reported: 0,
            response_time_ms,
            error: Some(error),
            query_params,
        }
    }

    pub fn error_kind(&self) -> Option<SourceErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_and_error_are_mutually_exclusive() {
        let ok = QueryResult::ok("web-search", vec![], 0, 12, None);
        assert!(ok.success);
        assert!(ok.error.is_none());

        let failed = QueryResult::failed(
            "contracts",
            SourceError::rate_limited("429 after backoff"),
            8_000,
            None,
        );
        assert!(!failed.success);
        assert_eq!(failed.error_kind(), Some(SourceErrorKind::RateLimited));
    }

    #[test]
    fn test_query_params_accessors() {
        let mut params = QueryParams::from_value(json!({
            "keywords": ["darpa", "hypersonics"],
            "agency": "DoD"
        }))
        .unwrap();

        assert_eq!(params.get_str("agency"), Some("DoD"));
        assert_eq!(params.get_str_array("keywords").len(), 2);
        assert!(params.get_str("missing").is_none());

        params.insert("limit", json!(10));
        assert_eq!(params.to_value()["limit"], 10);

        assert!(QueryParams::from_value(json!("not an object")).is_none());
    }

    #[test]
    fn test_item_builder() {
        let item = Item::new("Award", "https://example.gov/a/1")
            .with_description("R&D contract")
            .with_author("DoD")
            .with_extra(json!({"raw": true}));
        assert_eq!(item.url, "https://example.gov/a/1");
        assert_eq!(item.author.as_deref(), Some("DoD"));
        assert_eq!(item.extra["raw"], true);
    }

    #[test]
    fn test_question_serde_skips_empty_sensitivity() {
        let question = Question::new("federal cybersecurity jobs");
        let value = serde_json::to_value(&question).unwrap();
        assert!(value.get("sensitivity").is_none());

        let tagged = question.with_sensitivity(Sensitivity::Sensitive);
        let value = serde_json::to_value(&tagged).unwrap();
        assert_eq!(value["sensitivity"], "sensitive");
    }
}
