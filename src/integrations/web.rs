//! General web search integration.

use async_trait::async_trait;
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

pub struct WebSearchIntegration {
    metadata: SourceMetadata,
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptStore>,
    http: reqwest::Client,
    origin: String,
}

impl WebSearchIntegration {
    pub const ID: &'static str = "web-search";
    const DEFAULT_ORIGIN: &'static str = "https://api.search.brave.com";

    pub fn new(
        gateway: &Arc<LlmGateway>,
        prompts: &Arc<PromptStore>,
        config: &ResearchConfig,
    ) -> Result<Self> {
        let source = config.source(Self::ID);
        Ok(Self {
            metadata: SourceMetadata::new(Self::ID, SourceCategory::WebSearch)
                .with_credential(
                    source
                        .credential_env_name
                        .unwrap_or_else(|| "BRAVE_API_KEY".to_string()),
                )
                .with_cost_estimate(0.005)
                .with_typical_latency_ms(800),
            gateway: Arc::clone(gateway),
            prompts: Arc::clone(prompts),
            http: source_http_client(config, Self::ID)?,
            origin: source
                .origin
                .unwrap_or_else(|| Self::DEFAULT_ORIGIN.to_string()),
        })
    }
}

fn normalize(results: &[Value]) -> Vec<Item> {
    results
        .iter()
        .filter_map(|hit| {
            let title = hit.get("title").and_then(Value::as_str)?;
            let url = hit.get("url").and_then(Value::as_str)?;
            let mut item = Item::new(title, url)
                .with_description(
                    hit.get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                )
                .with_extra(hit.clone());
            if let Some(age) = hit
                .get("page_age")
                .and_then(Value::as_str)
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            {
                item = item.with_date(age.with_timezone(&chrono::Utc));
            }
            Some(item)
        })
        .collect()
}

#[async_trait]
impl Integration for WebSearchIntegration {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn query_schema(&self) -> JsonSchema {
        JsonSchema::object(
            "web_search_query",
            vec![
                FieldSpec::string("query"),
                FieldSpec::enumeration("freshness", ["pd", "pw", "pm", "py", "all"]).optional(),
                relevant_field(),
            ],
        )
    }

    async fn generate_query(&self, question: &Question) -> Result<Option<QueryParams>> {
        let generated = generate_query_via_llm(
            &self.gateway,
            &self.prompts,
            "query/web_search",
            question,
            &self.query_schema(),
        )
        .await?;

        Ok(generated.map(|mut params| {
            if params.get_str("query").map_or(true, str::is_empty) {
                params.insert("query", Value::String(question.text.clone()));
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

        let url = format!("{}/res/v1/web/search", self.origin);
        let mut pairs: Vec<(&str, String)> =
            vec![("q", query), ("count", limit.to_string())];
        if let Some(freshness) = params.get_str("freshness") {
            if freshness != "all" {
                pairs.push(("freshness", freshness.to_string()));
            }
        }

        let request = self
            .http
            .get(&url)
            .query(&pairs)
            .header("X-Subscription-Token", credential.unwrap_or_default())
            .header("Accept", "application/json");

        match fetch_json(Self::ID, request).await {
            Ok(payload) => {
                let results = payload
                    .pointer("/web/results")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let total = results.len() as u64;
                QueryResult::ok(
                    Self::ID,
                    normalize(&results),
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_web_hits() {
        let items = normalize(&[
            json!({
                "title": "JSOC operations overview",
                "url": "https://example.org/jsoc",
                "description": "Background reporting.",
                "page_age": "2024-06-01T00:00:00+00:00",
            }),
            json!({"description": "no title or url"}),
        ]);

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url, "https://example.org/jsoc");
        assert!(items[0].date.is_some());
    }
}
