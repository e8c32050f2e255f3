//! Pluggable adapters to external sources.
//!
//! Every integration exposes the same capability set: static metadata, a
//! cheap relevance gate, LLM-backed query generation constrained by a
//! strict schema, and a search execution step that returns normalized
//! items. Expected upstream failures become [`QueryResult`] error values;
//! nothing here raises across the dispatch boundary.

mod archive;
#[cfg(feature = "browser")]
mod browser;
mod contracts;
mod http;
mod jobs;
mod media;
mod query;
mod register;
mod registry;
mod social;
mod types;
mod web;

pub use archive::ArchiveIntegration;
#[cfg(feature = "browser")]
pub use browser::BrowserIntegration;
pub use contracts::ContractsIntegration;
pub use jobs::JobsIntegration;
pub use media::MediaIntegration;
pub use query::{fallback_keywords, split_or_terms, union_by_url};
pub use register::FederalRegisterIntegration;
pub use registry::{IntegrationRegistry, SourceStatus};
pub use social::SocialIntegration;
pub use types::{
    Item, QueryParams, QueryResult, Question, Sensitivity, SourceCategory, SourceError,
    SourceErrorKind, SourceMetadata,
};
pub use web::WebSearchIntegration;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{Operation, ResearchConfig};
use crate::error::Result;
use crate::llm::{JsonSchema, LlmGateway};
use crate::prompts::PromptStore;

/// Ids of the integrations this crate ships with, in registration order.
pub const BUILTIN_SOURCE_IDS: &[&str] = &[
    "contracts",
    "media",
    "jobs",
    "federal-register",
    "web-search",
    "twitter-like",
    "discord-archive",
    "documents-portal",
];

/// Uniform capability required of every source adapter.
#[async_trait]
pub trait Integration: Send + Sync {
    /// Static description: id, category, credential needs, cost hints.
    fn metadata(&self) -> &SourceMetadata;

    /// The strict schema `generate_query` output must conform to. Also used
    /// by the engine to validate reformulated parameters.
    fn query_schema(&self) -> JsonSchema;

    /// Cheap gate. The canonical policy is `true`: the LLM-backed decision
    /// lives in `generate_query`, which can opt out. Override only when a
    /// mismatch is statically certain.
    fn is_relevant(&self, _question: &Question) -> bool {
        true
    }

    /// Produce query parameters for the question, or `None` to opt out.
    async fn generate_query(&self, question: &Question) -> Result<Option<QueryParams>>;

    /// Run one logical query. Expected failures (rate limits, timeouts,
    /// anti-bot challenges, malformed payloads) are returned as
    /// `QueryResult` error values, never raised.
    async fn execute_search(
        &self,
        params: &QueryParams,
        credential: Option<&str>,
        limit: usize,
    ) -> QueryResult;
}

/// Shared query-generation path: render the integration's prompt, call the
/// gateway against its schema, honor the `relevant: false` opt-out.
pub(crate) async fn generate_query_via_llm(
    gateway: &LlmGateway,
    prompts: &PromptStore,
    template: &str,
    question: &Question,
    schema: &JsonSchema,
) -> Result<Option<QueryParams>> {
    let prompt = prompts.render(template, &[("question", &question.text)])?;
    let mut value = gateway
        .complete(&prompt, schema, Operation::QueryGeneration, None)
        .await?;

    if value.get("relevant").and_then(serde_json::Value::as_bool) == Some(false) {
        return Ok(None);
    }
    if let Some(object) = value.as_object_mut() {
        object.remove("relevant");
    }
    Ok(QueryParams::from_value(value))
}

/// The opt-out field every query-generation schema carries.
pub(crate) fn relevant_field() -> crate::llm::FieldSpec {
    crate::llm::FieldSpec::boolean("relevant")
}

/// Build the registry with the crate's built-in integrations, honoring the
/// per-source `enabled` flags. Registration failures stay isolated inside
/// the registry.
pub fn default_registry(
    config: &Arc<ResearchConfig>,
    gateway: &Arc<LlmGateway>,
    prompts: &Arc<PromptStore>,
) -> IntegrationRegistry {
    let mut registry = IntegrationRegistry::new();

    macro_rules! register {
        ($id:expr, $ctor:path) => {{
            let config = Arc::clone(config);
            let gateway = Arc::clone(gateway);
            let prompts = Arc::clone(prompts);
            registry.register($id, config.source($id).enabled, move || {
                Ok(Arc::new($ctor(&gateway, &prompts, &config)?) as Arc<dyn Integration>)
            });
        }};
    }

    register!("contracts", ContractsIntegration::new);
    register!("media", MediaIntegration::new);
    register!("jobs", JobsIntegration::new);
    register!("federal-register", FederalRegisterIntegration::new);
    register!("web-search", WebSearchIntegration::new);
    register!("twitter-like", SocialIntegration::new);
    register!("discord-archive", ArchiveIntegration::new);
    #[cfg(feature = "browser")]
    register!("documents-portal", BrowserIntegration::new);
    #[cfg(not(feature = "browser"))]
    {
        // Without the feature the id still resolves to a status entry, so
        // callers can see why the portal is unavailable.
        registry.register("documents-portal", false, || {
            Err(crate::error::Error::integration_init(
                "documents-portal",
                "built without the 'browser' feature",
            ))
        });
    }

    registry
}

/// Shared helper: build a reqwest client honoring the source's timeout.
pub(crate) fn source_http_client(
    config: &ResearchConfig,
    source_id: &str,
) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(
            config.source_timeout(source_id),
        ))
        .build()
        .map_err(|e| {
            crate::error::Error::integration_init(source_id, format!("http client: {e}"))
        })
}
