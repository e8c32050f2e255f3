//! Twitter-like social search integration.
//!
//! Goes through a generic third-party search service rather than the
//! platform's own API, so the credential is the service's key, not a
//! platform token.

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::config::ResearchConfig;
use crate::error::Result;
use crate::llm::{FieldSpec, JsonSchema, LlmGateway};
use crate::prompts::PromptStore;

use super::http::fetch_json;
use super::types::{Item, QueryParams, QueryResult, Question, SourceCategory, SourceMetadata};
use super::{generate_query_via_llm, relevant_field, source_http_client, Integration};

pub struct SocialIntegration {
    metadata: SourceMetadata,
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptStore>,
    http: reqwest::Client,
    origin: String,
}

impl SocialIntegration {
    pub const ID: &'static str = "twitter-like";
    const DEFAULT_ORIGIN: &'static str = "https://api.socialsearcher.example";

    pub fn new(
        gateway: &Arc<LlmGateway>,
        prompts: &Arc<PromptStore>,
        config: &ResearchConfig,
    ) -> Result<Self> {
        let source = config.source(Self::ID);
        Ok(Self {
            metadata: SourceMetadata::new(Self::ID, SourceCategory::Social)
                .with_credential(
                    source
                        .credential_env_name
                        .unwrap_or_else(|| "SOCIAL_SEARCH_API_KEY".to_string()),
                )
                .with_cost_estimate(0.002)
                .with_typical_latency_ms(1_000),
            gateway: Arc::clone(gateway),
            prompts: Arc::clone(prompts),
            http: source_http_client(config, Self::ID)?,
            origin: source
                .origin
                .unwrap_or_else(|| Self::DEFAULT_ORIGIN.to_string()),
        })
    }
}

fn normalize(tweets: &[Value]) -> Vec<Item> {
    tweets
        .iter()
        .filter_map(|tweet| {
            let id = tweet.get("id").and_then(Value::as_str)?;
            let text = tweet.get("text").and_then(Value::as_str)?;
            let username = tweet
                .pointer("/user/username")
                .and_then(Value::as_str)
                .unwrap_or("unknown");

            let snippet: String = text.chars().take(80).collect();
            let mut item = Item::new(
                format!("@{username}: {snippet}"),
                format!("https://x.com/{username}/status/{id}"),
            )
            .with_description(text)
            .with_author(format!("@{username}"))
            .with_extra(tweet.clone());
            if let Some(date) = tweet
                .get("created_at")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            {
                item = item.with_date(date.with_timezone(&chrono::Utc));
            }
            Some(item)
        })
        .collect()
}

#[async_trait]
impl Integration for SocialIntegration {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn query_schema(&self) -> JsonSchema {
        JsonSchema::object(
            "social_query",
            vec![FieldSpec::string("query"), relevant_field()],
        )
    }

    async fn generate_query(&self, question: &Question) -> Result<Option<QueryParams>> {
        let generated = generate_query_via_llm(
            &self.gateway,
            &self.prompts,
            "query/social",
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
        credential: Option<&str>,
        limit: usize,
    ) -> QueryResult {
        let started = Instant::now();
        let query = params.get_str("query").unwrap_or_default().to_string();

        let url = format!("{}/twitter/search", self.origin);
        let request = self
            .http
            .get(&url)
            .query(&[("query", query.as_str()), ("limit", &limit.to_string())])
            .header("x-api-key", credential.unwrap_or_default());

        match fetch_json(Self::ID, request).await {
            Ok(payload) => {
                let tweets = payload
                    .get("tweets")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let total = payload
                    .get("total")
                    .and_then(Value::as_u64)
                    .unwrap_or(tweets.len() as u64);
                QueryResult::ok(
                    Self::ID,
                    normalize(&tweets),
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
