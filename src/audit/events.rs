//! Execution event types for the per-run audit trail.
//!
//! Events form an append-only stream that can be rendered differently per
//! consumer: JSONL on disk for audits, a live progress stream for UIs,
//! or single-line log output for terminals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::integrations::SourceErrorKind;

/// Types of events emitted during a research run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionEventType {
    /// Run accepted; first event of every stream
    RunStart,
    /// Sources chosen for a subtask
    SourceSelection,
    /// One upstream query dispatched
    ApiCall,
    /// Raw upstream payload archived
    RawResponse,
    /// Relevance score assigned to a result set
    RelevanceScoring,
    /// Accept/reformulate/reject decision
    FilterDecision,
    /// Subtask reached a terminal state
    TaskComplete,
    /// Run finished; last event of every stream
    RunComplete,
    /// A prioritized source failed across all attempts
    CriticalSourceFailure,
    /// Free-form progress note
    Progress,
}

impl std::fmt::Display for ExecutionEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RunStart => "RUN_START",
            Self::SourceSelection => "SOURCE_SELECTION",
            Self::ApiCall => "API_CALL",
            Self::RawResponse => "RAW_RESPONSE",
            Self::RelevanceScoring => "RELEVANCE_SCORING",
            Self::FilterDecision => "FILTER_DECISION",
            Self::TaskComplete => "TASK_COMPLETE",
            Self::RunComplete => "RUN_COMPLETE",
            Self::CriticalSourceFailure => "CRITICAL_SOURCE_FAILURE",
            Self::Progress => "PROGRESS",
        };
        write!(f, "{s}")
    }
}

/// An event in the run's totally-ordered audit stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub event_type: ExecutionEventType,
    pub ts: DateTime<Utc>,
    pub payload: Value,
}

impl ExecutionEvent {
    pub fn new(event_type: ExecutionEventType, payload: Value) -> Self {
        Self {
            event_type,
            ts: Utc::now(),
            payload,
        }
    }

    // Convenience constructors for the fixed vocabulary.

    pub fn run_start(run_id: &str, question: &str, sensitivity: &str) -> Self {
        Self::new(
            ExecutionEventType::RunStart,
            json!({"run_id": run_id, "question": question, "sensitivity": sensitivity}),
        )
    }

    pub fn source_selection(subtask_id: &str, sources: &[String]) -> Self {
        Self::new(
            ExecutionEventType::SourceSelection,
            json!({"subtask_id": subtask_id, "sources": sources}),
        )
    }

    pub fn api_call(subtask_id: &str, source_id: &str, attempt: u32, params: &Value) -> Self {
        Self::new(
            ExecutionEventType::ApiCall,
            json!({
                "subtask_id": subtask_id,
                "source_id": source_id,
                "attempt": attempt,
                "params": params,
            }),
        )
    }

    pub fn raw_response(
        subtask_id: &str,
        source_id: &str,
        attempt: u32,
        raw_key: &str,
        item_count: usize,
    ) -> Self {
        Self::new(
            ExecutionEventType::RawResponse,
            json!({
                "subtask_id": subtask_id,
                "source_id": source_id,
                "attempt": attempt,
                "raw_key": raw_key,
                "item_count": item_count,
            }),
        )
    }

    pub fn relevance_scoring(
        subtask_id: &str,
        source_id: &str,
        score: u8,
        threshold: u8,
        rationale: &str,
    ) -> Self {
        Self::new(
            ExecutionEventType::RelevanceScoring,
            json!({
                "subtask_id": subtask_id,
                "source_id": source_id,
                "score": score,
                "threshold": threshold,
                "rationale": rationale,
            }),
        )
    }

    pub fn filter_decision(
        subtask_id: &str,
        source_id: &str,
        decision: &str,
        accepted_count: usize,
    ) -> Self {
        Self::new(
            ExecutionEventType::FilterDecision,
            json!({
                "subtask_id": subtask_id,
                "source_id": source_id,
                "decision": decision,
                "accepted_count": accepted_count,
            }),
        )
    }

    pub fn task_complete(subtask_id: &str, state: &str, accepted_count: usize) -> Self {
        Self::new(
            ExecutionEventType::TaskComplete,
            json!({
                "subtask_id": subtask_id,
                "state": state,
                "accepted_count": accepted_count,
            }),
        )
    }

    pub fn run_complete(run_id: &str, succeeded: bool, total_cost_usd: f64) -> Self {
        Self::new(
            ExecutionEventType::RunComplete,
            json!({
                "run_id": run_id,
                "succeeded": succeeded,
                "total_cost_usd": total_cost_usd,
            }),
        )
    }

    pub fn critical_source_failure(
        source_id: &str,
        attempts: u32,
        kinds: &[SourceErrorKind],
    ) -> Self {
        Self::new(
            ExecutionEventType::CriticalSourceFailure,
            json!({
                "source_id": source_id,
                "attempts": attempts,
                "error_kinds": kinds,
            }),
        )
    }

    pub fn progress(message: impl Into<String>) -> Self {
        Self::new(ExecutionEventType::Progress, json!({"message": message.into()}))
    }

    pub fn is_run_complete(&self) -> bool {
        self.event_type == ExecutionEventType::RunComplete
    }

    /// Format as a single-line log entry.
    pub fn as_log_line(&self) -> String {
        let detail = self
            .payload
            .as_object()
            .map(|o| {
                o.iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        format!(
            "[{}] {}: {}",
            self.ts.format("%H:%M:%S%.3f"),
            self.event_type,
            detail
        )
    }
}
