//! LLM types for requests, responses, models, and cost accounting.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// LLM provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Provider {
    Anthropic,
    OpenAi,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::OpenAi => write!(f, "openai"),
        }
    }
}

/// Model definition with pricing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model identifier (e.g., "claude-3-5-sonnet-20241022")
    pub id: String,
    pub provider: Provider,
    /// Maximum output tokens. Sent as the provider ceiling where the wire
    /// format demands a value; callers of the gateway never set caps.
    pub max_output: u32,
    /// Input cost per million tokens (USD)
    pub input_cost_per_m: f64,
    /// Output cost per million tokens (USD)
    pub output_cost_per_m: f64,
}

impl ModelSpec {
    /// Calculate cost for given token usage.
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input_cost = (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_m;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_m;
        input_cost + output_cost
    }

    pub fn claude_sonnet() -> Self {
        Self {
            id: "claude-3-5-sonnet-20241022".to_string(),
            provider: Provider::Anthropic,
            max_output: 8192,
            input_cost_per_m: 3.0,
            output_cost_per_m: 15.0,
        }
    }

    pub fn claude_haiku() -> Self {
        Self {
            id: "claude-3-5-haiku-20241022".to_string(),
            provider: Provider::Anthropic,
            max_output: 8192,
            input_cost_per_m: 0.8,
            output_cost_per_m: 4.0,
        }
    }

    pub fn gpt4o() -> Self {
        Self {
            id: "gpt-4o".to_string(),
            provider: Provider::OpenAi,
            max_output: 16384,
            input_cost_per_m: 2.5,
            output_cost_per_m: 10.0,
        }
    }

    pub fn gpt4o_mini() -> Self {
        Self {
            id: "gpt-4o-mini".to_string(),
            provider: Provider::OpenAi,
            max_output: 16384,
            input_cost_per_m: 0.15,
            output_cost_per_m: 0.60,
        }
    }

    fn known() -> Vec<ModelSpec> {
        vec![
            Self::claude_sonnet(),
            Self::claude_haiku(),
            Self::gpt4o(),
            Self::gpt4o_mini(),
        ]
    }

    /// Resolve a spec for an arbitrary model id. Unknown ids are mapped to a
    /// provider by name prefix with conservative pricing, so cost tracking
    /// keeps working for models released after this table was written.
    pub fn for_model_id(id: &str) -> Self {
        if let Some(spec) = Self::known().into_iter().find(|m| m.id == id) {
            return spec;
        }
        if id.starts_with("claude") {
            Self {
                id: id.to_string(),
                ..Self::claude_sonnet()
            }
        } else {
            Self {
                id: id.to_string(),
                ..Self::gpt4o()
            }
        }
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A completion request.
///
/// There is deliberately no output-length field: reasoning-class models
/// truncate silently under token caps, so the gateway always requests the
/// provider ceiling and relies on schemas to bound output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model id; the client's default is used when absent.
    pub model: Option<String>,
    /// System prompt.
    pub system: Option<String>,
    /// Conversation messages.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Ask the provider for native strict-JSON output where supported.
    pub strict_json: bool,
}

impl CompletionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_strict_json(mut self, strict_json: bool) -> Self {
        self.strict_json = strict_json;
        self
    }
}

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
}

/// Token usage for an LLM call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub model: String,
    pub content: String,
    pub stop_reason: Option<StopReason>,
    pub usage: TokenUsage,
    /// Calculated cost in USD.
    pub cost: f64,
}

/// Costs for a specific model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCosts {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub call_count: u64,
}

/// Mutable per-run cost ledger, owned by the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostTracker {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_usd: f64,
    pub call_count: u64,
    pub by_model: HashMap<String, ModelCosts>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record usage from a completion response.
    pub fn record(&mut self, model: &str, usage: &TokenUsage, cost_usd: f64) {
        self.total_input_tokens += usage.input_tokens;
        self.total_output_tokens += usage.output_tokens;
        self.total_usd += cost_usd;
        self.call_count += 1;

        let model_costs = self.by_model.entry(model.to_string()).or_default();
        model_costs.input_tokens += usage.input_tokens;
        model_costs.output_tokens += usage.output_tokens;
        model_costs.cost_usd += cost_usd;
        model_costs.call_count += 1;
    }

    /// Copy out an immutable snapshot.
    pub fn snapshot(&self) -> CostSnapshot {
        CostSnapshot {
            per_model: self.by_model.clone(),
            total_usd: self.total_usd,
            call_count: self.call_count,
        }
    }
}

/// Immutable view of accumulated spend, embedded in run records and reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub per_model: HashMap<String, ModelCosts>,
    pub total_usd: f64,
    pub call_count: u64,
}

impl CostSnapshot {
    /// The spend added since `baseline` was taken. Lets a run report its
    /// own cost when the gateway outlives individual runs.
    pub fn delta_since(&self, baseline: &CostSnapshot) -> CostSnapshot {
        let mut per_model = HashMap::new();
        for (model, costs) in &self.per_model {
            let base = baseline.per_model.get(model).cloned().unwrap_or_default();
            let delta = ModelCosts {
                input_tokens: costs.input_tokens.saturating_sub(base.input_tokens),
                output_tokens: costs.output_tokens.saturating_sub(base.output_tokens),
                cost_usd: (costs.cost_usd - base.cost_usd).max(0.0),
                call_count: costs.call_count.saturating_sub(base.call_count),
            };
            if delta.call_count > 0 {
                per_model.insert(model.clone(), delta);
            }
        }
        CostSnapshot {
            per_model,
            total_usd: (self.total_usd - baseline.total_usd).max(0.0),
            call_count: self.call_count.saturating_sub(baseline.call_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_cost() {
        let spec = ModelSpec::claude_sonnet();
        let cost = spec.calculate_cost(1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_for_model_id_known_and_unknown() {
        assert_eq!(ModelSpec::for_model_id("gpt-4o").provider, Provider::OpenAi);
        let future = ModelSpec::for_model_id("claude-9-opus");
        assert_eq!(future.provider, Provider::Anthropic);
        assert_eq!(future.id, "claude-9-opus");
    }

    #[test]
    fn test_cost_tracker_record_and_snapshot() {
        let mut tracker = CostTracker::new();
        tracker.record("m1", &TokenUsage::new(1000, 500), 0.05);
        tracker.record("m1", &TokenUsage::new(100, 50), 0.01);
        tracker.record("m2", &TokenUsage::new(10, 5), 0.001);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.call_count, 3);
        assert!((snapshot.total_usd - 0.061).abs() < 1e-9);
        assert_eq!(snapshot.per_model["m1"].call_count, 2);
        assert_eq!(snapshot.per_model["m1"].input_tokens, 1100);
    }

    #[test]
    fn test_snapshot_delta() {
        let mut tracker = CostTracker::new();
        tracker.record("m1", &TokenUsage::new(100, 50), 0.01);
        let baseline = tracker.snapshot();

        tracker.record("m1", &TokenUsage::new(200, 100), 0.02);
        tracker.record("m2", &TokenUsage::new(10, 5), 0.001);
        let delta = tracker.snapshot().delta_since(&baseline);

        assert_eq!(delta.call_count, 2);
        assert!((delta.total_usd - 0.021).abs() < 1e-9);
        assert_eq!(delta.per_model["m1"].call_count, 1);
        assert_eq!(delta.per_model["m1"].input_tokens, 200);
        assert_eq!(delta.per_model["m2"].call_count, 1);
    }

    #[test]
    fn test_request_builder() {
        let request = CompletionRequest::new()
            .with_model("gpt-4o")
            .with_message(ChatMessage::user("hi"))
            .with_temperature(0.1)
            .with_strict_json(true);

        assert_eq!(request.model.as_deref(), Some("gpt-4o"));
        assert_eq!(request.messages.len(), 1);
        assert!(request.strict_json);
    }
}
