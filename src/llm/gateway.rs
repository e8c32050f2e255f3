//! The single choke point for model calls.
//!
//! Every LLM-backed operation in the engine and the integrations goes
//! through [`LlmGateway::complete`]: schema-enforced structured output,
//! per-operation model selection, transport fallback chains, and run-scoped
//! cost accounting live here so provider quirks never leak outward.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::config::{CostConfig, LlmConfig, Operation};
use crate::error::{Error, Result};

use super::client::LlmClient;
use super::schema::{extract_json, JsonSchema};
use super::types::{
    ChatMessage, CompletionRequest, CompletionResponse, CostSnapshot, CostTracker, ModelSpec,
    Provider,
};

/// Per-call options recognized by the gateway.
///
/// There is no output-length option: certain reasoning-class models
/// truncate silently under length caps, so callers constrain output with
/// schemas instead.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Override the operation's configured temperature.
    pub temperature: Option<f64>,
    /// Override the configured fallback chain.
    pub fallback_models: Vec<String>,
    /// Transport retries per model before moving down the chain.
    pub max_retries: Option<u32>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_fallback_models<S: Into<String>>(
        mut self,
        models: impl IntoIterator<Item = S>,
    ) -> Self {
        self.fallback_models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

const DEFAULT_TRANSPORT_RETRIES: u32 = 1;

fn to_micro_usd(usd: f64) -> u64 {
    (usd * 1_000_000.0).round().max(0.0) as u64
}

/// Uniform, cost-tracked LLM invocation with enforced structured output.
pub struct LlmGateway {
    clients: HashMap<Provider, Arc<dyn LlmClient>>,
    llm_config: LlmConfig,
    cost: RwLock<CostTracker>,
    /// Fast-path spend counter for ceiling checks; the detailed ledger is
    /// eventually consistent with it.
    spent_micro_usd: AtomicU64,
    limit_micro_usd: u64,
    warn_micro_usd: u64,
    warned: AtomicBool,
}

impl LlmGateway {
    pub fn new(llm_config: LlmConfig, cost_config: &CostConfig) -> Self {
        let limit = to_micro_usd(cost_config.max_cost_per_run);
        Self {
            clients: HashMap::new(),
            llm_config,
            cost: RwLock::new(CostTracker::new()),
            spent_micro_usd: AtomicU64::new(0),
            limit_micro_usd: limit,
            warn_micro_usd: to_micro_usd(cost_config.max_cost_per_run * cost_config.warn_ratio),
            warned: AtomicBool::new(false),
        }
    }

    /// Add a provider client.
    pub fn with_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.clients.insert(client.provider(), client);
        self
    }

    /// Complete `prompt` and return a value conforming to `schema`.
    ///
    /// The model is selected per `operation`; on transport failure the
    /// fallback chain is walked in order. A response that fails schema
    /// validation gets one stricter retry on the same model, then surfaces
    /// as [`Error::LlmParse`].
    pub async fn complete(
        &self,
        prompt: &str,
        schema: &JsonSchema,
        operation: Operation,
        options: Option<CallOptions>,
    ) -> Result<Value> {
        self.check_budget()?;

        let options = options.unwrap_or_default();
        let temperature = options
            .temperature
            .unwrap_or_else(|| self.llm_config.temperature_for(operation));
        let max_retries = options.max_retries.unwrap_or(DEFAULT_TRANSPORT_RETRIES);

        let mut chain = vec![self.llm_config.model_for(operation).to_string()];
        if options.fallback_models.is_empty() {
            chain.extend(self.llm_config.fallback_models.iter().cloned());
        } else {
            chain.extend(options.fallback_models);
        }

        let full_prompt = format!("{prompt}\n\n{}", schema.to_prompt_block());
        let mut last_transport: Option<Error> = None;

        for model in &chain {
            let Some(client) = self.clients.get(&ModelSpec::for_model_id(model).provider) else {
                last_transport = Some(Error::llm_transport(
                    model.clone(),
                    "no client configured for this model's provider",
                ));
                continue;
            };

            match self
                .attempt_model(client.as_ref(), model, &full_prompt, temperature, max_retries)
                .await
            {
                Ok(response) => {
                    return self
                        .parse_or_retry(
                            client.as_ref(),
                            model,
                            &full_prompt,
                            temperature,
                            schema,
                            response,
                        )
                        .await;
                }
                Err(err) => {
                    warn!(model = %model, operation = %operation, error = %err, "model failed, trying next in chain");
                    last_transport = Some(err);
                }
            }
        }

        Err(last_transport
            .unwrap_or_else(|| Error::Internal("empty model chain".to_string())))
    }

    /// One model, `1 + max_retries` transport attempts.
    async fn attempt_model(
        &self,
        client: &dyn LlmClient,
        model: &str,
        prompt: &str,
        temperature: f64,
        max_retries: u32,
    ) -> Result<CompletionResponse> {
        let mut last = None;
        for attempt in 0..=max_retries {
            let request = CompletionRequest::new()
                .with_model(model)
                .with_message(ChatMessage::user(prompt))
                .with_temperature(temperature)
                .with_strict_json(true);

            match client.complete(request).await {
                Ok(response) => {
                    self.record(&response);
                    return Ok(response);
                }
                Err(err) => {
                    debug!(model, attempt, error = %err, "transport attempt failed");
                    last = Some(err);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::Internal("no attempt made".to_string())))
    }

    /// Validate a response against the schema; on failure, retry once with
    /// a stricter prompt carrying the rejection reason.
    async fn parse_or_retry(
        &self,
        client: &dyn LlmClient,
        model: &str,
        prompt: &str,
        temperature: f64,
        schema: &JsonSchema,
        response: CompletionResponse,
    ) -> Result<Value> {
        let schema_failure = match Self::parse_against(&response.content, schema) {
            Ok(value) => return Ok(value),
            Err(message) => message,
        };

        let strict_prompt = format!(
            "{prompt}\n\nYour previous reply was rejected: {schema_failure}. \
             Return ONLY the JSON object, with exactly the listed fields."
        );
        let request = CompletionRequest::new()
            .with_model(model)
            .with_message(ChatMessage::user(strict_prompt))
            .with_temperature(temperature)
            .with_strict_json(true);

        let retry = client.complete(request).await?;
        self.record(&retry);
        Self::parse_against(&retry.content, schema).map_err(Error::llm_parse)
    }

    fn parse_against(content: &str, schema: &JsonSchema) -> std::result::Result<Value, String> {
        let value =
            extract_json(content).ok_or_else(|| "no JSON object found in reply".to_string())?;
        schema.validate(&value).map_err(|errors| errors.join("; "))?;
        Ok(value)
    }

    fn check_budget(&self) -> Result<()> {
        if self.limit_micro_usd == 0 {
            return Ok(());
        }
        let spent = self.spent_micro_usd.load(Ordering::Relaxed);
        if spent >= self.limit_micro_usd {
            return Err(Error::budget_exceeded(
                self.limit_micro_usd as f64 / 1_000_000.0,
                spent as f64 / 1_000_000.0,
            ));
        }
        Ok(())
    }

    fn record(&self, response: &CompletionResponse) {
        let spent = self
            .spent_micro_usd
            .fetch_add(to_micro_usd(response.cost), Ordering::Relaxed)
            + to_micro_usd(response.cost);

        if spent >= self.warn_micro_usd
            && self.warn_micro_usd > 0
            && !self.warned.swap(true, Ordering::Relaxed)
        {
            warn!(
                spent_usd = spent as f64 / 1_000_000.0,
                limit_usd = self.limit_micro_usd as f64 / 1_000_000.0,
                "run cost approaching the configured ceiling"
            );
        }

        let mut cost = self.cost.write().expect("cost lock poisoned");
        cost.record(&response.model, &response.usage, response.cost);
    }

    /// Copy out the current spend ledger.
    pub fn cost_snapshot(&self) -> CostSnapshot {
        self.cost.read().expect("cost lock poisoned").snapshot()
    }

    /// Reset the ledger, the spend counter, and the warning latch.
    pub fn reset_cost(&self) {
        *self.cost.write().expect("cost lock poisoned") = CostTracker::new();
        self.spent_micro_usd.store(0, Ordering::Relaxed);
        self.warned.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::schema::FieldSpec;
    use crate::llm::testing::{ScriptStep, ScriptedClient};

    fn schema() -> JsonSchema {
        JsonSchema::object(
            "verdict",
            vec![
                FieldSpec::integer("score", 0, 10),
                FieldSpec::string("rationale"),
            ],
        )
    }

    fn gateway_with(steps: Vec<ScriptStep>) -> (LlmGateway, Arc<ScriptedClient>) {
        let client = Arc::new(ScriptedClient::anthropic(steps));
        let gateway = LlmGateway::new(LlmConfig::default(), &CostConfig::default())
            .with_client(client.clone());
        (gateway, client)
    }

    #[tokio::test]
    async fn test_complete_returns_validated_json() {
        let (gateway, client) = gateway_with(vec![ScriptStep::reply(
            r#"{"score": 8, "rationale": "direct match"}"#,
        )]);

        let value = gateway
            .complete("score this", &schema(), Operation::Relevance, None)
            .await
            .unwrap();
        assert_eq!(value["score"], 8);
        assert_eq!(client.call_count(), 1);

        // The prompt carries the schema instruction block.
        let prompts = client.prompts();
        assert!(prompts[0].contains("single JSON object"));
    }

    #[tokio::test]
    async fn test_parse_failure_retries_once_with_stricter_prompt() {
        let (gateway, client) = gateway_with(vec![
            ScriptStep::reply("sorry, I cannot produce JSON"),
            ScriptStep::reply(r#"{"score": 2, "rationale": "weak"}"#),
        ]);

        let value = gateway
            .complete("score this", &schema(), Operation::Relevance, None)
            .await
            .unwrap();
        assert_eq!(value["score"], 2);
        assert_eq!(client.call_count(), 2);
        assert!(client.prompts()[1].contains("previous reply was rejected"));
    }

    #[tokio::test]
    async fn test_transport_retry_then_success() {
        let (gateway, client) = gateway_with(vec![
            ScriptStep::transport_error("connection reset"),
            ScriptStep::reply(r#"{"score": 5, "rationale": "ok"}"#),
        ]);

        let value = gateway
            .complete("score this", &schema(), Operation::Relevance, None)
            .await
            .unwrap();
        assert_eq!(value["score"], 5);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_chain_surfaces_transport_error() {
        // Default retries: 2 attempts per model; both models' attempts fail.
        let (gateway, _client) = gateway_with(vec![
            ScriptStep::transport_error("down"),
            ScriptStep::transport_error("down"),
            ScriptStep::transport_error("down"),
            ScriptStep::transport_error("down"),
        ]);

        // Restrict the chain to anthropic models so the scripted client
        // covers every hop.
        let options = CallOptions::new().with_fallback_models(["claude-3-5-haiku-20241022"]);
        let err = gateway
            .complete("score this", &schema(), Operation::Synthesis, Some(options))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LlmTransport { .. }));
    }

    #[tokio::test]
    async fn test_budget_ceiling_stops_calls() {
        let cost_config = CostConfig {
            max_cost_per_run: 0.000001,
            warn_ratio: 0.5,
        };
        let client = Arc::new(
            ScriptedClient::anthropic(vec![
                ScriptStep::reply(r#"{"score": 1, "rationale": "x"}"#),
                ScriptStep::reply(r#"{"score": 1, "rationale": "x"}"#),
            ])
            .with_cost_per_call(0.01),
        );
        let gateway =
            LlmGateway::new(LlmConfig::default(), &cost_config).with_client(client.clone());

        // First call succeeds and pushes spend over the ceiling.
        gateway
            .complete("a", &schema(), Operation::Relevance, None)
            .await
            .unwrap();
        let err = gateway
            .complete("b", &schema(), Operation::Relevance, None)
            .await
            .unwrap_err();
        assert!(err.is_budget_stop());
        assert_eq!(client.call_count(), 1);

        // Reset clears the ceiling state.
        gateway.reset_cost();
        assert_eq!(gateway.cost_snapshot().call_count, 0);
    }

    #[tokio::test]
    async fn test_cost_snapshot_accumulates() {
        let (gateway, _client) = gateway_with(vec![
            ScriptStep::reply(r#"{"score": 1, "rationale": "a"}"#),
            ScriptStep::reply(r#"{"score": 2, "rationale": "b"}"#),
        ]);

        gateway
            .complete("a", &schema(), Operation::Relevance, None)
            .await
            .unwrap();
        gateway
            .complete("b", &schema(), Operation::Relevance, None)
            .await
            .unwrap();

        let snapshot = gateway.cost_snapshot();
        assert_eq!(snapshot.call_count, 2);
        assert!(snapshot.total_usd > 0.0);
    }
}
