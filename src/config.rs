//! Run configuration: defaults, user overrides, environment variables.
//!
//! Configuration is merged in three layers: built-in defaults, then a JSON
//! overrides document supplied by the caller, then environment variables.
//! `validate()` runs at engine construction so a bad configuration fails at
//! startup rather than at first use.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// LLM-backed operations the engine performs. Each resolves to a model id
/// and a temperature through [`LlmConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Decomposition,
    SourceSelection,
    QueryGeneration,
    Relevance,
    Reformulation,
    EntityExtraction,
    Followups,
    Synthesis,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decomposition => "decomposition",
            Self::SourceSelection => "source_selection",
            Self::QueryGeneration => "query_generation",
            Self::Relevance => "relevance",
            Self::Reformulation => "reformulation",
            Self::EntityExtraction => "entity_extraction",
            Self::Followups => "followups",
            Self::Synthesis => "synthesis",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Model selection and sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    /// Model used when no per-operation override exists.
    pub default_model: String,
    /// Per-operation model overrides.
    pub per_operation: HashMap<Operation, String>,
    /// Models attempted in order after a transport failure.
    pub fallback_models: Vec<String>,
    /// Per-operation temperature overrides.
    pub temperature_per_operation: HashMap<Operation, f64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let mut per_operation = HashMap::new();
        per_operation.insert(Operation::Relevance, "claude-3-5-haiku-20241022".to_string());
        per_operation.insert(
            Operation::QueryGeneration,
            "claude-3-5-haiku-20241022".to_string(),
        );

        let mut temperature_per_operation = HashMap::new();
        temperature_per_operation.insert(Operation::Decomposition, 0.4);
        temperature_per_operation.insert(Operation::Synthesis, 0.3);

        Self {
            default_model: "claude-3-5-sonnet-20241022".to_string(),
            per_operation,
            fallback_models: vec!["gpt-4o".to_string()],
            temperature_per_operation,
        }
    }
}

impl LlmConfig {
    /// Resolve the model id for an operation.
    pub fn model_for(&self, op: Operation) -> &str {
        self.per_operation
            .get(&op)
            .map(String::as_str)
            .unwrap_or(&self.default_model)
    }

    /// Resolve the temperature for an operation.
    pub fn temperature_for(&self, op: Operation) -> f64 {
        self.temperature_per_operation.get(&op).copied().unwrap_or(0.2)
    }
}

/// Concurrency, retry, and task budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Global in-flight request ceiling across all sources.
    pub max_concurrent_total: usize,
    /// Default per-source concurrency cap (overridable per source).
    pub max_concurrent_per_source: usize,
    /// Reformulation rounds allowed per source result.
    pub max_refinements: u32,
    /// Items requested per query unless a caller overrides.
    pub default_result_limit: usize,
    /// Total subtask budget per run, follow-ups included.
    pub max_tasks: usize,
    /// Reformulation retries allowed per subtask.
    pub max_retries_per_task: u32,
    /// Run-wide deadline in minutes.
    pub max_time_minutes: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_total: 8,
            max_concurrent_per_source: 2,
            max_refinements: 2,
            default_result_limit: 20,
            max_tasks: 12,
            max_retries_per_task: 2,
            max_time_minutes: 20,
        }
    }
}

impl ExecutionConfig {
    /// Subtasks processed concurrently per batch.
    pub fn batch_size(&self) -> usize {
        (self.max_concurrent_total / self.max_concurrent_per_source.max(1)).max(1)
    }
}

/// Timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutsConfig {
    /// Per upstream API request.
    pub api_request: u64,
    /// Per LLM call.
    pub llm_request: u64,
    /// Per full subtask-source search, reformulations included.
    pub total_search: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            api_request: 30,
            llm_request: 120,
            total_search: 300,
        }
    }
}

/// Per-source configuration under `sources.<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub enabled: bool,
    /// Overrides `timeouts.api_request` for this source, in seconds.
    pub timeout: Option<u64>,
    /// Default date window when the upstream requires one.
    pub default_date_range_days: i64,
    /// Base URL for REST sources, or root directory for local archives.
    pub origin: Option<String>,
    /// Overrides the integration's built-in credential variable name.
    pub credential_env_name: Option<String>,
    /// Overrides `execution.max_concurrent_per_source` for this source.
    pub max_concurrent: Option<usize>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: None,
            default_date_range_days: 90,
            origin: None,
            credential_env_name: None,
            max_concurrent: None,
        }
    }
}

/// Cost ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CostConfig {
    /// Hard per-run LLM spend ceiling in USD.
    pub max_cost_per_run: f64,
    /// Fraction of the ceiling at which a warning is logged.
    pub warn_ratio: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            max_cost_per_run: 5.0,
            warn_ratio: 0.8,
        }
    }
}

/// Engine-level knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Relevance threshold for public questions (0-10).
    pub public_threshold: u8,
    /// Relevance threshold for sensitive questions (0-10). Deliberately low:
    /// classified topics surface indirect evidence that scores poorly but is
    /// the best available signal.
    pub sensitive_threshold: u8,
    /// Extract entities after each subtask instead of once at run end.
    pub entity_extraction_per_subtask: bool,
    /// Emit entity attributes and relationships, not just name and type.
    pub rich_entities: bool,
    /// Let follow-up subtasks dispatch to browser-scraper sources.
    pub allow_browser_followups: bool,
    /// Directory receiving one subdirectory per run.
    pub output_root: PathBuf,
    /// Directory holding prompt templates.
    pub prompt_root: PathBuf,
    /// "Recent window" injected into temporal prompt context, in days.
    pub recent_window_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            public_threshold: 3,
            sensitive_threshold: 1,
            entity_extraction_per_subtask: false,
            rich_entities: false,
            allow_browser_followups: false,
            output_root: PathBuf::from("runs"),
            prompt_root: PathBuf::from("prompts"),
            recent_window_days: 30,
        }
    }
}

/// Complete merged configuration for the research engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResearchConfig {
    pub llm: LlmConfig,
    pub execution: ExecutionConfig,
    pub timeouts: TimeoutsConfig,
    pub sources: HashMap<String, SourceConfig>,
    pub cost: CostConfig,
    pub engine: EngineConfig,
}

impl ResearchConfig {
    /// Defaults plus the built-in source table.
    pub fn new() -> Self {
        let mut config = Self::default();
        for id in crate::integrations::BUILTIN_SOURCE_IDS {
            config.sources.entry(id.to_string()).or_default();
        }
        // The documents portal is opt-in: headless scraping is slow and flaky.
        config
            .sources
            .entry("documents-portal".to_string())
            .and_modify(|s| s.enabled = false);
        config
    }

    /// Per-source config, falling back to defaults for unknown ids.
    pub fn source(&self, id: &str) -> SourceConfig {
        self.sources.get(id).cloned().unwrap_or_default()
    }

    /// Effective request timeout for a source, in seconds.
    pub fn source_timeout(&self, id: &str) -> u64 {
        self.source(id).timeout.unwrap_or(self.timeouts.api_request)
    }

    /// Effective concurrency cap for a source.
    pub fn source_concurrency(&self, id: &str) -> usize {
        self.source(id)
            .max_concurrent
            .unwrap_or(self.execution.max_concurrent_per_source)
            .max(1)
    }

    /// Apply a JSON overrides document on top of this configuration.
    ///
    /// Objects merge recursively; scalars and arrays replace. Unknown keys
    /// are rejected by serde when the merged document is decoded, so a typo
    /// in an override fails here rather than being silently ignored.
    pub fn merged_with(&self, overrides: &Value) -> Result<Self> {
        let mut base = serde_json::to_value(self)?;
        deep_merge(&mut base, overrides);
        let merged: Self = serde_json::from_value(base)?;
        Ok(merged)
    }

    /// Overlay recognized environment variables.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse::<usize>("DOSSIER_MAX_TASKS") {
            self.execution.max_tasks = v;
        }
        if let Some(v) = env_parse::<u64>("DOSSIER_MAX_TIME_MINUTES") {
            self.execution.max_time_minutes = v;
        }
        if let Some(v) = env_parse::<f64>("DOSSIER_MAX_COST_USD") {
            self.cost.max_cost_per_run = v;
        }
        if let Ok(v) = std::env::var("DOSSIER_DEFAULT_MODEL") {
            if !v.is_empty() {
                self.llm.default_model = v;
            }
        }
        if let Ok(v) = std::env::var("DOSSIER_OUTPUT_ROOT") {
            if !v.is_empty() {
                self.engine.output_root = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("DOSSIER_PROMPT_ROOT") {
            if !v.is_empty() {
                self.engine.prompt_root = PathBuf::from(v);
            }
        }
    }

    /// Reject configurations that would fail at first use.
    pub fn validate(&self) -> Result<()> {
        if self.llm.default_model.is_empty() {
            return Err(Error::config("llm.default_model must not be empty"));
        }
        if self.execution.max_concurrent_total == 0 {
            return Err(Error::config("execution.max_concurrent_total must be > 0"));
        }
        if self.execution.max_concurrent_per_source == 0 {
            return Err(Error::config(
                "execution.max_concurrent_per_source must be > 0",
            ));
        }
        if self.execution.default_result_limit == 0 {
            return Err(Error::config("execution.default_result_limit must be > 0"));
        }
        if self.execution.max_tasks == 0 {
            return Err(Error::config("execution.max_tasks must be > 0"));
        }
        if self.engine.public_threshold > 10 || self.engine.sensitive_threshold > 10 {
            return Err(Error::config("relevance thresholds must be within 0-10"));
        }
        if self.engine.sensitive_threshold > self.engine.public_threshold {
            return Err(Error::config(
                "engine.sensitive_threshold must not exceed engine.public_threshold",
            ));
        }
        if self.cost.max_cost_per_run <= 0.0 {
            return Err(Error::config("cost.max_cost_per_run must be > 0"));
        }
        if !(self.cost.warn_ratio > 0.0 && self.cost.warn_ratio <= 1.0) {
            return Err(Error::config("cost.warn_ratio must be in (0, 1]"));
        }
        for (id, source) in &self.sources {
            if let Some(0) = source.max_concurrent {
                return Err(Error::config(format!(
                    "sources.{id}.max_concurrent must be > 0"
                )));
            }
            if let Some(0) = source.timeout {
                return Err(Error::config(format!("sources.{id}.timeout must be > 0")));
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Recursive merge of `overlay` into `base`. Objects merge key-wise;
/// everything else replaces.
fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value.clone(),
    }
}
