//! Relevance scoring decisions and adaptive thresholds.
//!
//! Scoring itself is an LLM call; everything around it is pure and unit
//! tested: threshold selection by sensitivity, and the accept /
//! reformulate / reject decision given a score and the retry budget.

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::integrations::Sensitivity;
use crate::llm::{FieldSpec, JsonSchema};

/// What to do with a scored result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Reformulate,
    Reject,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::Reformulate => write!(f, "reformulate"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// A scored result set.
///
/// The accept/reformulate/reject decision is not stored here: it depends
/// on the subtask's accrued retry count, so the filter loop derives it
/// from the score with [`decide`] at the moment it is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelevanceVerdict {
    /// 0-10 integer scale.
    pub score: u8,
    pub rationale: String,
}

/// Schema for the relevance-scoring LLM call.
pub fn relevance_schema() -> JsonSchema {
    JsonSchema::object(
        "relevance",
        vec![
            FieldSpec::integer("score", 0, 10),
            FieldSpec::string("rationale"),
        ],
    )
}

/// The acceptance threshold for a question of the given sensitivity.
///
/// The sensitive threshold is deliberately low: classified topics produce
/// indirect evidence (budget lines, passing press mentions) that scores
/// poorly but is the best available signal.
pub fn threshold_for(sensitivity: Sensitivity, config: &EngineConfig) -> u8 {
    match sensitivity {
        Sensitivity::Public => config.public_threshold,
        Sensitivity::Sensitive => config.sensitive_threshold,
    }
}

/// Pure decision function over a score, the threshold, and the retry budget.
pub fn decide(score: u8, threshold: u8, retry_count: u32, max_retries: u32) -> Decision {
    if score >= threshold {
        Decision::Accept
    } else if retry_count < max_retries {
        Decision::Reformulate
    } else {
        Decision::Reject
    }
}
