//! # dossier-core
//!
//! A deep-research orchestration library for investigative reporting: a
//! natural-language question goes in, a structured, cited report comes out.
//!
//! ## Core Components
//!
//! - **LlmGateway**: schema-enforced, cost-tracked model calls with
//!   fallback chains
//! - **PromptStore**: file-based prompt templates with temporal context
//! - **IntegrationRegistry**: lazy, failure-isolated source catalog
//! - **ParallelExecutor**: bounded fan-out with per-source rate shaping
//! - **DeepResearchEngine**: the investigative loop (decompose, dispatch,
//!   filter, extract, follow up, synthesize)
//! - **ExecutionLogger**: append-only per-run audit trail
//!
//! ## Example
//!
//! ```rust,ignore
//! use dossier_core::{DeepResearchEngine, LlmGateway, Question, ResearchConfig};
//! use std::sync::Arc;
//!
//! let mut config = ResearchConfig::new();
//! config.apply_env();
//!
//! let gateway = Arc::new(
//!     LlmGateway::new(config.llm.clone(), &config.cost)
//!         .with_client(Arc::new(anthropic_client)),
//! );
//! let engine = DeepResearchEngine::new(config, gateway)?;
//!
//! let record = engine
//!     .run_research(Question::new("Reddit discussion of Section 702"), None)
//!     .await?;
//! println!("{}", record.report.executive_summary);
//! ```

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod integrations;
pub mod llm;
pub mod prompts;

// Re-exports for convenience
pub use audit::{read_event_log, ExecutionEvent, ExecutionEventType, ExecutionLogger};
pub use config::{
    CostConfig, EngineConfig, ExecutionConfig, LlmConfig, Operation, ResearchConfig, SourceConfig,
    TimeoutsConfig,
};
pub use engine::{
    classify, decide, threshold_for, CriticalSourceFailure, Decision, DeepResearchEngine, Entity,
    EntityRelationship, EntityType, EventStream, Limitation, RelevanceVerdict, Report, RunRecord,
    Subtask, SubtaskFindings, SubtaskState,
};
pub use error::{Error, Result};
pub use executor::ParallelExecutor;
pub use integrations::{
    default_registry, ArchiveIntegration, ContractsIntegration, FederalRegisterIntegration,
    Integration, IntegrationRegistry, Item, JobsIntegration, MediaIntegration, QueryParams,
    QueryResult, Question, Sensitivity, SocialIntegration, SourceCategory, SourceError,
    SourceErrorKind, SourceMetadata, SourceStatus, WebSearchIntegration,
};
#[cfg(feature = "browser")]
pub use integrations::BrowserIntegration;
pub use llm::{
    AnthropicClient, CallOptions, ChatMessage, ChatRole, ClientConfig, CompletionRequest,
    CompletionResponse, CostSnapshot, CostTracker, FieldKind, FieldSpec, JsonSchema, LlmClient,
    LlmGateway, ModelSpec, OpenAiClient, Provider, TokenUsage,
};
pub use prompts::PromptStore;
