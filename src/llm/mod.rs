//! LLM gateway: providers, schemas, and cost-tracked structured calls.
//!
//! All model access flows through [`LlmGateway`], which enforces
//! strict-JSON schemas, hides provider quirks (no caller-visible output
//! caps, per-provider JSON modes), walks fallback chains on transport
//! failure, and keeps the per-run cost ledger.

mod client;
mod gateway;
mod schema;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{client_for_model, AnthropicClient, ClientConfig, LlmClient, OpenAiClient};
pub use gateway::{CallOptions, LlmGateway};
pub use schema::{extract_json, FieldKind, FieldSpec, JsonSchema};
pub use types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, CostSnapshot, CostTracker,
    ModelCosts, ModelSpec, Provider, StopReason, TokenUsage,
};
