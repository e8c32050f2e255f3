//! Federal jobs API integration.
//!
//! The upstream understands only simple boolean expressions: a single AND,
//! OR, or NOT. Parenthesized or mixed queries return zero results instead
//! of an error, so the query prompt forbids them, generated keywords are
//! sanitized defensively, and a zero-result disjunction falls back to
//! per-term queries unioned by URL.

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
use super::query::{split_or_terms, union_by_url};
use super::types::{
    Item, QueryParams, QueryResult, Question, SourceCategory, SourceError, SourceMetadata,
};
use super::{generate_query_via_llm, relevant_field, source_http_client, Integration};

pub struct JobsIntegration {
    metadata: SourceMetadata,
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptStore>,
    http: reqwest::Client,
    origin: String,
}

impl JobsIntegration {
    pub const ID: &'static str = "jobs";
    const DEFAULT_ORIGIN: &'static str = "https://data.usajobs.gov";

    pub fn new(
        gateway: &Arc<LlmGateway>,
        prompts: &Arc<PromptStore>,
        config: &ResearchConfig,
    ) -> Result<Self> {
        let source = config.source(Self::ID);
        Ok(Self {
            metadata: SourceMetadata::new(Self::ID, SourceCategory::Government)
                .with_credential(
                    source
                        .credential_env_name
                        .unwrap_or_else(|| "USAJOBS_API_KEY".to_string()),
                )
                .with_typical_latency_ms(1_500),
            gateway: Arc::clone(gateway),
            prompts: Arc::clone(prompts),
            http: source_http_client(config, Self::ID)?,
            origin: source
                .origin
                .unwrap_or_else(|| Self::DEFAULT_ORIGIN.to_string()),
        })
    }

    async fn search_once(
        &self,
        keyword: &str,
        location: Option<&str>,
        credential: &str,
        limit: usize,
    ) -> std::result::Result<(Vec<Item>, u64), SourceError> {
        let url = format!("{}/api/search", self.origin);
        let mut query: Vec<(&str, String)> = vec![
            ("Keyword", keyword.to_string()),
            ("ResultsPerPage", limit.to_string()),
        ];
        if let Some(location) = location {
            query.push(("LocationName", location.to_string()));
        }

        let request = self
            .http
            .get(&url)
            .query(&query)
            .header("Host", "data.usajobs.gov")
            .header("Authorization-Key", credential);

        let payload = fetch_json(Self::ID, request).await?;
        let items = payload
            .pointer("/SearchResult/SearchResultItems")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = payload
            .pointer("/SearchResult/SearchResultCountAll")
            .and_then(Value::as_u64)
            .unwrap_or(items.len() as u64);
        Ok((normalize(&items), total))
    }
}

fn normalize(results: &[Value]) -> Vec<Item> {
    results
        .iter()
        .filter_map(|entry| {
            let descriptor = entry.get("MatchedObjectDescriptor")?;
            let title = descriptor.get("PositionTitle").and_then(Value::as_str)?;
            let url = descriptor.get("PositionURI").and_then(Value::as_str)?;

            let organization = descriptor
                .get("OrganizationName")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let summary = descriptor
                .pointer("/UserArea/Details/JobSummary")
                .and_then(Value::as_str)
                .unwrap_or_default();

            let mut item = Item::new(title, url)
                .with_description(summary)
                .with_author(organization)
                .with_extra(entry.clone());
            if let Some(date) = descriptor
                .get("PublicationStartDate")
                .and_then(Value::as_str)
                .and_then(parse_publication_date)
            {
                item = item.with_date(date);
            }
            Some(item)
        })
        .collect()
}

fn parse_publication_date(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&chrono::Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| d.and_utc())
        })
}

/// Strip syntax the upstream silently chokes on: parentheses, and mixed
/// AND/OR expressions (the first boolean operator wins).
fn sanitize_keyword(keyword: &str) -> String {
    let cleaned: String = keyword.replace(['(', ')'], " ");
    let has_and = cleaned.contains(" AND ");
    let has_or = cleaned.contains(" OR ");
    let simplified = if has_and && has_or {
        // Keep the leading operator family by cutting at the second kind.
        let and_pos = cleaned.find(" AND ").unwrap_or(usize::MAX);
        let or_pos = cleaned.find(" OR ").unwrap_or(usize::MAX);
        if and_pos < or_pos {
            cleaned.split(" OR ").next().unwrap_or(&cleaned).to_string()
        } else {
            cleaned.split(" AND ").next().unwrap_or(&cleaned).to_string()
        }
    } else {
        cleaned
    };
    simplified.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl Integration for JobsIntegration {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn query_schema(&self) -> JsonSchema {
        JsonSchema::object(
            "jobs_query",
            vec![
                FieldSpec::string("keyword"),
                FieldSpec::string("location").optional(),
                relevant_field(),
            ],
        )
    }

    async fn generate_query(&self, question: &Question) -> Result<Option<QueryParams>> {
        let generated = generate_query_via_llm(
            &self.gateway,
            &self.prompts,
            "query/jobs",
            question,
            &self.query_schema(),
        )
        .await?;

        Ok(generated.map(|mut params| {
            let keyword = params.get_str("keyword").unwrap_or_default();
            let sanitized = sanitize_keyword(keyword);
            let keyword = if sanitized.is_empty() {
                super::query::fallback_keywords(&question.text, 3).join(" OR ")
            } else {
                sanitized
            };
            params.insert("keyword", Value::String(keyword));
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
        let keyword = params.get_str("keyword").unwrap_or_default().to_string();
        let location = params.get_str("location").map(str::to_string);
        let credential = credential.unwrap_or_default();

        let first = self
            .search_once(&keyword, location.as_deref(), credential, limit)
            .await;

        // Zero results on a disjunction usually means the upstream dropped
        // the whole expression; retry per term and union.
        let terms = split_or_terms(&keyword);
        let outcome = match first {
            Ok((items, _)) if items.is_empty() && terms.len() > 1 => {
                let mut sets = Vec::new();
                for term in &terms {
                    if let Ok((items, _)) = self
                        .search_once(term, location.as_deref(), credential, limit)
                        .await
                    {
                        sets.push(items);
                    }
                }
                let merged = union_by_url(sets);
                let total = merged.len() as u64;
                Ok((merged, total))
            }
            other => other,
        };

        match outcome {
            Ok((mut items, total)) => {
                items.truncate(limit);
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
