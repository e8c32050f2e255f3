//! Government media API integration (military press and imagery search).
//!
//! The upstream rejects queries with more than 2 OR-joined quoted phrases
//! and throttles concurrent requests. The query prompt steers the LLM
//! toward unquoted keywords; when a composite query is refused or comes
//! back empty, it is decomposed into single-term queries and the results
//! are unioned by URL.

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::config::ResearchConfig;
use crate::error::Result;
use crate::llm::{FieldSpec, JsonSchema, LlmGateway};
use crate::prompts::PromptStore;

use super::http::{fetch_json, looks_like_boolean_refusal};
use super::query::{split_or_terms, union_by_url};
use super::types::{
    Item, QueryParams, QueryResult, Question, SourceCategory, SourceError, SourceMetadata,
};
use super::{generate_query_via_llm, relevant_field, source_http_client, Integration};

pub struct MediaIntegration {
    metadata: SourceMetadata,
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptStore>,
    http: reqwest::Client,
    origin: String,
}

impl MediaIntegration {
    pub const ID: &'static str = "media";
    const DEFAULT_ORIGIN: &'static str = "https://api.dvidshub.net";

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
                        .unwrap_or_else(|| "DVIDS_API_KEY".to_string()),
                )
                .with_typical_latency_ms(2_000),
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
        q: &str,
        credential: Option<&str>,
        limit: usize,
    ) -> std::result::Result<(Vec<Item>, u64), SourceError> {
        let url = format!("{}/search", self.origin);
        let request = self.http.get(&url).query(&[
            ("q", q),
            ("max_results", &limit.to_string()),
            ("api_key", credential.unwrap_or_default()),
        ]);

        let payload = fetch_json(Self::ID, request).await?;
        let results = payload
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = payload
            .pointer("/page_info/total_results")
            .and_then(Value::as_u64)
            .unwrap_or(results.len() as u64);
        Ok((normalize(&results), total))
    }
}

fn normalize(results: &[Value]) -> Vec<Item> {
    results
        .iter()
        .filter_map(|entry| {
            let title = entry.get("title").and_then(Value::as_str)?;
            let id = entry.get("id").and_then(Value::as_str)?;
            let url = entry
                .get("url")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("https://www.dvidshub.net/asset/{id}"));

            let mut item = Item::new(title, url)
                .with_description(
                    entry
                        .get("short_description")
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                )
                .with_extra(entry.clone());
            if let Some(credit) = entry.get("credit").and_then(Value::as_str) {
                item = item.with_author(credit);
            }
            if let Some(date) = entry
                .get("date_published")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            {
                item = item.with_date(date.with_timezone(&chrono::Utc));
            }
            Some(item)
        })
        .collect()
}

/// More than 2 OR-joined quoted phrases is a guaranteed refusal upstream.
fn exceeds_phrase_limit(q: &str) -> bool {
    let terms = split_or_terms(q);
    terms.len() > 2 && terms.iter().filter(|t| t.starts_with('"')).count() > 2
}

#[async_trait]
impl Integration for MediaIntegration {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn query_schema(&self) -> JsonSchema {
        JsonSchema::object(
            "media_query",
            vec![FieldSpec::string("q"), relevant_field()],
        )
    }

    async fn generate_query(&self, question: &Question) -> Result<Option<QueryParams>> {
        let generated = generate_query_via_llm(
            &self.gateway,
            &self.prompts,
            "query/media",
            question,
            &self.query_schema(),
        )
        .await?;

        Ok(generated.map(|mut params| {
            if params.get_str("q").map_or(true, str::is_empty) {
                params.insert(
                    "q",
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
        let q = params.get_str("q").unwrap_or_default().to_string();
        let terms = split_or_terms(&q);

        // Composite queries are tried as-is first unless they are certain
        // to be refused; decomposition kicks in on refusal or zero items.
        let first = if exceeds_phrase_limit(&q) {
            Err(SourceError::transport("media: HTTP 400: phrase limit"))
        } else {
            self.search_once(&q, credential, limit).await
        };

        let needs_split = terms.len() > 1
            && match &first {
                Ok((items, _)) => items.is_empty(),
                Err(err) => looks_like_boolean_refusal(err),
            };

        let outcome = if needs_split {
            // Decompose: one query per term, union by URL.
            let mut sets = Vec::new();
            let mut failure = None;
            for term in &terms {
                match self.search_once(term, credential, limit).await {
                    Ok((items, _)) => sets.push(items),
                    Err(err) => failure = Some(err),
                }
            }
            if sets.is_empty() {
                Err(failure.unwrap_or_else(|| SourceError::transport("media: no results")))
            } else {
                let merged = union_by_url(sets);
                let total = merged.len() as u64;
                Ok((merged, total))
            }
        } else {
            first
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phrase_limit_detection() {
        assert!(exceeds_phrase_limit(
            r#""special access" OR "black budget" OR "code name""#
        ));
        assert!(!exceeds_phrase_limit(r#""special access" OR "black budget""#));
        assert!(!exceeds_phrase_limit("jsoc OR socom OR syria"));
    }

    #[test]
    fn test_normalize_synthesizes_asset_url() {
        let items = normalize(&[json!({
            "id": "video:987",
            "title": "Training exercise footage",
            "short_description": "Joint exercise",
            "credit": "Sgt. Example",
            "date_published": "2024-05-01T12:00:00+00:00",
        })]);

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url, "https://www.dvidshub.net/asset/video:987");
        assert_eq!(items[0].author.as_deref(), Some("Sgt. Example"));
        assert!(items[0].date.is_some());
    }

    #[test]
    fn test_normalize_drops_untitled_entries() {
        assert!(normalize(&[json!({"id": "x"})]).is_empty());
    }
}
