//! Error types for dossier-core.

use thiserror::Error;

/// Result type alias using dossier-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during research orchestration.
///
/// Integration-level failures (rate limiting, timeouts, anti-bot challenges)
/// are not represented here: they never cross the dispatch boundary and are
/// recorded as values on [`crate::integrations::QueryResult`] instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration rejected at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// A prompt template file does not exist
    #[error("Prompt template not found: {name}")]
    PromptNotFound { name: String },

    /// A prompt template could not be rendered
    #[error("Prompt render error in '{template}': {message}")]
    PromptRender { template: String, message: String },

    /// An integration factory failed during instantiation
    #[error("Integration '{id}' failed to initialize: {message}")]
    IntegrationInit { id: String, message: String },

    /// LLM provider transport failure (network, auth, provider outage)
    #[error("LLM transport error: {provider} - {message}")]
    LlmTransport { provider: String, message: String },

    /// LLM output did not conform to the requested schema
    #[error("LLM structured-output parse error: {0}")]
    LlmParse(String),

    /// A per-run cost ceiling was crossed
    #[error("LLM budget exceeded: spent ${spent_usd:.4} of ${limit_usd:.4}")]
    BudgetExceeded { limit_usd: f64, spent_usd: f64 },

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error (run directory, execution log, raw store)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a prompt-not-found error.
    pub fn prompt_not_found(name: impl Into<String>) -> Self {
        Self::PromptNotFound { name: name.into() }
    }

    /// Create a prompt render error.
    pub fn prompt_render(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PromptRender {
            template: template.into(),
            message: message.into(),
        }
    }

    /// Create an integration initialization error.
    pub fn integration_init(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::IntegrationInit {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Create an LLM transport error.
    pub fn llm_transport(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmTransport {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an LLM parse error.
    pub fn llm_parse(message: impl Into<String>) -> Self {
        Self::LlmParse(message.into())
    }

    /// Create a budget-exceeded error.
    pub fn budget_exceeded(limit_usd: f64, spent_usd: f64) -> Self {
        Self::BudgetExceeded {
            limit_usd,
            spent_usd,
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// True for errors that should terminate the run loop promptly
    /// rather than degrade to the next source or subtask.
    pub fn is_budget_stop(&self) -> bool {
        matches!(self, Self::BudgetExceeded { .. })
    }
}
