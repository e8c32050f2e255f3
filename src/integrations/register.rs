//! Federal register integration: standard paged JSON, no credential.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
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

pub struct FederalRegisterIntegration {
    metadata: SourceMetadata,
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptStore>,
    http: reqwest::Client,
    origin: String,
    default_window_days: i64,
}

impl FederalRegisterIntegration {
    pub const ID: &'static str = "federal-register";
    const DEFAULT_ORIGIN: &'static str = "https://www.federalregister.gov";

    pub fn new(
        gateway: &Arc<LlmGateway>,
        prompts: &Arc<PromptStore>,
        config: &ResearchConfig,
    ) -> Result<Self> {
        let source = config.source(Self::ID);
        Ok(Self {
            metadata: SourceMetadata::new(Self::ID, SourceCategory::Government)
                .with_typical_latency_ms(1_200),
            gateway: Arc::clone(gateway),
            prompts: Arc::clone(prompts),
            http: source_http_client(config, Self::ID)?,
            origin: source
                .origin
                .unwrap_or_else(|| Self::DEFAULT_ORIGIN.to_string()),
            default_window_days: source.default_date_range_days,
        })
    }
}

fn normalize(results: &[Value]) -> Vec<Item> {
    results
        .iter()
        .filter_map(|doc| {
            let title = doc.get("title").and_then(Value::as_str)?;
            let url = doc.get("html_url").and_then(Value::as_str)?;

            let agencies = doc
                .get("agencies")
                .and_then(Value::as_array)
                .map(|agencies| {
                    agencies
                        .iter()
                        .filter_map(|a| a.get("name").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();

            let mut item = Item::new(title, url)
                .with_description(
                    doc.get("abstract")
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                )
                .with_extra(doc.clone());
            if !agencies.is_empty() {
                item = item.with_author(agencies);
            }
            if let Some(date) = doc
                .get("publication_date")
                .and_then(Value::as_str)
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
            {
                item = item.with_date(date.and_utc());
            }
            Some(item)
        })
        .collect()
}

#[async_trait]
impl Integration for FederalRegisterIntegration {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn query_schema(&self) -> JsonSchema {
        JsonSchema::object(
            "federal_register_query",
            vec![
                FieldSpec::string("term"),
                FieldSpec::string_array("agencies").optional(),
                relevant_field(),
            ],
        )
    }

    async fn generate_query(&self, question: &Question) -> Result<Option<QueryParams>> {
        let generated = generate_query_via_llm(
            &self.gateway,
            &self.prompts,
            "query/federal_register",
            question,
            &self.query_schema(),
        )
        .await?;

        Ok(generated.map(|mut params| {
            if params.get_str("term").map_or(true, str::is_empty) {
                params.insert(
                    "term",
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
        let term = params.get_str("term").unwrap_or_default().to_string();
        let since = (Utc::now().date_naive() - Duration::days(self.default_window_days))
            .format("%Y-%m-%d")
            .to_string();

        let url = format!("{}/api/v1/documents.json", self.origin);
        let per_page = limit.to_string();
        let mut query: Vec<(String, String)> = vec![
            ("conditions[term]".to_string(), term),
            ("conditions[publication_date][gte]".to_string(), since),
            ("per_page".to_string(), per_page),
            ("order".to_string(), "newest".to_string()),
        ];
        for agency in params.get_str_array("agencies") {
            query.push(("conditions[agencies][]".to_string(), agency));
        }

        let request = self.http.get(&url).query(&query);
        match fetch_json(Self::ID, request).await {
            Ok(payload) => {
                let results = payload
                    .get("results")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let total = payload
                    .get("count")
                    .and_then(Value::as_u64)
                    .unwrap_or(results.len() as u64);
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
    fn test_normalize_joins_agencies() {
        let items = normalize(&[json!({
            "title": "Notice of Proposed Rulemaking",
            "html_url": "https://www.federalregister.gov/documents/2024/1",
            "abstract": "Surveillance program review.",
            "publication_date": "2024-04-15",
            "agencies": [{"name": "Department of Justice"}, {"name": "ODNI"}],
        })]);

        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].author.as_deref(),
            Some("Department of Justice, ODNI")
        );
        assert!(items[0].date.is_some());
    }

    #[test]
    fn test_normalize_requires_title_and_url() {
        assert!(normalize(&[json!({"title": "no url"})]).is_empty());
        assert!(normalize(&[json!({"html_url": "https://x"})]).is_empty());
    }
}
