//! Government contracts API integration (spending-award search).
//!
//! Upstream quirks preserved here: the search endpoint demands a date
//! window of at most one year, and it rate-limits aggressively under
//! parallel load. The window is clamped rather than rejected, and rate
//! limiting degrades to a `RateLimited` result after backoff.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

use crate::config::ResearchConfig;
use crate::error::Result;
use crate::llm::{FieldSpec, JsonSchema, LlmGateway};
use crate::prompts::PromptStore;

use super::http::fetch_json;
use super::query::fallback_keywords;
use super::types::{Item, QueryParams, QueryResult, Question, SourceCategory, SourceMetadata};
use super::{generate_query_via_llm, relevant_field, source_http_client, Integration};

const MAX_WINDOW_DAYS: i64 = 365;

pub struct ContractsIntegration {
    metadata: SourceMetadata,
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptStore>,
    http: reqwest::Client,
    origin: String,
    default_window_days: i64,
}

impl ContractsIntegration {
    pub const ID: &'static str = "contracts";
    const DEFAULT_ORIGIN: &'static str = "https://api.usaspending.gov";

    pub fn new(
        gateway: &Arc<LlmGateway>,
        prompts: &Arc<PromptStore>,
        config: &ResearchConfig,
    ) -> Result<Self> {
        let source = config.source(Self::ID);
        Ok(Self {
            metadata: SourceMetadata::new(Self::ID, SourceCategory::Government)
                .with_typical_latency_ms(3_000),
            gateway: Arc::clone(gateway),
            prompts: Arc::clone(prompts),
            http: source_http_client(config, Self::ID)?,
            origin: source
                .origin
                .unwrap_or_else(|| Self::DEFAULT_ORIGIN.to_string()),
            default_window_days: source.default_date_range_days,
        })
    }

    /// Resolve the award-search window, clamped to the upstream's one-year
    /// maximum and defaulting to the configured recent window ending today.
    fn window(&self, params: &QueryParams) -> (NaiveDate, NaiveDate) {
        let today = Utc::now().date_naive();
        let end = params
            .get_str("end_date")
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .unwrap_or(today);
        let default_start = end - Duration::days(self.default_window_days.min(MAX_WINDOW_DAYS));
        let mut start = params
            .get_str("start_date")
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .unwrap_or(default_start);
        if end - start > Duration::days(MAX_WINDOW_DAYS) {
            start = end - Duration::days(MAX_WINDOW_DAYS);
        }
        (start, end)
    }

    fn normalize(&self, results: &[Value]) -> Vec<Item> {
        results
            .iter()
            .filter_map(|award| {
                let internal_id = award.get("generated_internal_id")?.as_str()?;
                let recipient = award
                    .get("Recipient Name")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown recipient");
                let description = award
                    .get("Description")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let amount = award.get("Award Amount").and_then(Value::as_f64);

                let title = match amount {
                    Some(amount) => format!("{recipient} (${amount:.0})"),
                    None => recipient.to_string(),
                };
                let date = award
                    .get("Start Date")
                    .and_then(Value::as_str)
                    .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| dt.and_utc());

                let mut item = Item::new(
                    title,
                    format!("https://www.usaspending.gov/award/{internal_id}"),
                )
                .with_description(description)
                .with_author(
                    award
                        .get("Awarding Agency")
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown agency"),
                )
                .with_extra(award.clone());
                if let Some(date) = date {
                    item = item.with_date(date);
                }
                Some(item)
            })
            .collect()
    }
}

#[async_trait]
impl Integration for ContractsIntegration {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn query_schema(&self) -> JsonSchema {
        JsonSchema::object(
            "contracts_query",
            vec![
                FieldSpec::string_array("keywords"),
                FieldSpec::string("start_date").optional(),
                FieldSpec::string("end_date").optional(),
                FieldSpec::string("agency").optional(),
                relevant_field(),
            ],
        )
    }

    async fn generate_query(&self, question: &Question) -> Result<Option<QueryParams>> {
        let generated = generate_query_via_llm(
            &self.gateway,
            &self.prompts,
            "query/contracts",
            question,
            &self.query_schema(),
        )
        .await?;

        // Never dispatch with an empty keyword list; fall back to the
        // question's own terms.
        Ok(generated.map(|mut params| {
            if params.get_str_array("keywords").is_empty() {
                params.insert("keywords", json!(fallback_keywords(&question.text, 6)));
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
        let (start, end) = self.window(params);
        let keywords = params.get_str_array("keywords");

        let body = json!({
            "filters": {
                "keywords": keywords,
                "time_period": [{
                    "start_date": start.format("%Y-%m-%d").to_string(),
                    "end_date": end.format("%Y-%m-%d").to_string(),
                }],
            },
            "fields": [
                "Award ID", "Recipient Name", "Description", "Award Amount",
                "Awarding Agency", "Start Date",
            ],
            "limit": limit,
            "page": 1,
        });

        let url = format!("{}/api/v2/search/spending_by_award/", self.origin);
        let request = self.http.post(&url).json(&body);

        match fetch_json(Self::ID, request).await {
            Ok(payload) => {
                let results = payload
                    .get("results")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let total = payload
                    .pointer("/page_metadata/total")
                    .and_then(Value::as_u64)
                    .unwrap_or(results.len() as u64);
                QueryResult::ok(
                    Self::ID,
                    self.normalize(&results),
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
    use crate::config::CostConfig;
    use crate::config::LlmConfig;
    use serde_json::json;

    fn integration() -> ContractsIntegration {
        let gateway = Arc::new(LlmGateway::new(LlmConfig::default(), &CostConfig::default()));
        let prompts = Arc::new(PromptStore::new("prompts", 30));
        ContractsIntegration::new(&gateway, &prompts, &ResearchConfig::new()).unwrap()
    }

    #[test]
    fn test_window_clamped_to_one_year() {
        let integration = integration();
        let params = QueryParams::from_value(json!({
            "keywords": ["radar"],
            "start_date": "2015-01-01",
            "end_date": "2024-06-30",
        }))
        .unwrap();

        let (start, end) = integration.window(&params);
        assert_eq!(end, NaiveDate::from_ymd_opt(2024, 6, 30).unwrap());
        assert_eq!(end - start, Duration::days(MAX_WINDOW_DAYS));
    }

    #[test]
    fn test_window_defaults_to_recent() {
        let integration = integration();
        let (start, end) = integration.window(&QueryParams::new());
        assert_eq!(end, Utc::now().date_naive());
        assert_eq!(end - start, Duration::days(90));
    }

    #[test]
    fn test_normalize_maps_awards_to_items() {
        let integration = integration();
        let results = vec![json!({
            "generated_internal_id": "CONT_AWD_123",
            "Recipient Name": "LOCKHEED MARTIN CORPORATION",
            "Description": "HYPERSONIC RESEARCH",
            "Award Amount": 1500000.0,
            "Awarding Agency": "Department of Defense",
            "Start Date": "2024-02-01",
        })];

        let items = integration.normalize(&results);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url, "https://www.usaspending.gov/award/CONT_AWD_123");
        assert!(items[0].title.contains("LOCKHEED"));
        assert!(items[0].title.contains("1500000"));
        assert_eq!(items[0].author.as_deref(), Some("Department of Defense"));
        assert!(items[0].date.is_some());
        // Raw payload survives in extra.
        assert_eq!(items[0].extra["generated_internal_id"], "CONT_AWD_123");
    }

    #[test]
    fn test_normalize_skips_entries_without_id() {
        let integration = integration();
        let results = vec![json!({"Recipient Name": "NO ID CORP"})];
        assert!(integration.normalize(&results).is_empty());
    }

    #[test]
    fn test_schema_requires_keywords_and_opt_out() {
        let schema = integration().query_schema();
        assert!(schema
            .validate(&json!({"keywords": ["darpa"], "relevant": true}))
            .is_ok());
        assert!(schema.validate(&json!({"relevant": true})).is_err());
    }
}
