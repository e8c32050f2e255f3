//! Run-scoped data model: subtasks, run records, critical failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::integrations::{Question, SourceErrorKind};
use crate::llm::CostSnapshot;

use super::report::Report;

/// Lifecycle state of a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Never dispatched: the run hit a deadline or budget first.
    Abandoned,
}

impl std::fmt::Display for SubtaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}

/// A focused query derived from the user's question. Ids are unique within
/// a run and ordered by creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_hint: Option<String>,
    pub retry_count: u32,
    pub state: SubtaskState,
}

impl Subtask {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            source_hint: None,
            retry_count: 0,
            state: SubtaskState::Pending,
        }
    }

    pub fn with_source_hint(mut self, hint: impl Into<String>) -> Self {
        self.source_hint = Some(hint.into());
        self
    }
}

/// A prioritized source that produced nothing but failures across the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalSourceFailure {
    pub source_id: String,
    pub attempts: u32,
    pub error_kinds: Vec<SourceErrorKind>,
}

/// The complete record of one engine invocation. Owns its subtasks, cost
/// ledger, and report; events live in the run directory on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub question: Question,
    pub config_snapshot: Value,
    pub subtasks: Vec<Subtask>,
    pub cost: CostSnapshot,
    pub critical_source_failures: Vec<CriticalSourceFailure>,
    pub report: Report,
}

impl RunRecord {
    /// A run succeeds if any subtask succeeded.
    pub fn succeeded(&self) -> bool {
        self.subtasks
            .iter()
            .any(|subtask| subtask.state == SubtaskState::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtask_defaults() {
        let subtask = Subtask::new("t1", "trace the award history");
        assert_eq!(subtask.state, SubtaskState::Pending);
        assert_eq!(subtask.retry_count, 0);
        assert!(subtask.source_hint.is_none());
    }

    #[test]
    fn test_run_succeeds_if_any_subtask_did() {
        let mut record = RunRecord {
            run_id: "run-1".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            question: Question::new("q"),
            config_snapshot: Value::Null,
            subtasks: vec![
                Subtask::new("t1", "a"),
                Subtask::new("t2", "b"),
            ],
            cost: CostSnapshot::default(),
            critical_source_failures: Vec::new(),
            report: Report::empty("q"),
        };
        record.subtasks[0].state = SubtaskState::Failed;
        assert!(!record.succeeded());

        record.subtasks[1].state = SubtaskState::Succeeded;
        assert!(record.succeeded());
    }
}
