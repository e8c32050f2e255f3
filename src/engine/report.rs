//! Report assembly and rendering.
//!
//! Reports are built from run data; only the executive summary comes from
//! an LLM call. Even a run with zero accepted items produces a report
//! with an explicit limitations section.

use serde::{Deserialize, Serialize};

use crate::integrations::{Item, SourceErrorKind};
use crate::llm::CostSnapshot;

use super::entities::Entity;
use super::types::{CriticalSourceFailure, SubtaskState};

/// Accepted evidence for one subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskFindings {
    pub subtask_id: String,
    pub description: String,
    pub state: SubtaskState,
    pub accepted_items: Vec<Item>,
    /// Sources that contributed at least one accepted item.
    pub sources_used: Vec<String>,
}

/// One entry in the limitations section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limitation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Error kind or category label (e.g. "rate_limited", "budget").
    pub kind: String,
    pub detail: String,
}

impl Limitation {
    pub fn for_source(failure: &CriticalSourceFailure) -> Self {
        let kinds: Vec<String> = failure
            .error_kinds
            .iter()
            .map(SourceErrorKind::to_string)
            .collect();
        Self {
            source_id: Some(failure.source_id.clone()),
            kind: kinds.first().cloned().unwrap_or_else(|| "unknown".to_string()),
            detail: format!(
                "source failed across all {} attempts ({})",
                failure.attempts,
                kinds.join(", ")
            ),
        }
    }

    pub fn general(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            source_id: None,
            kind: kind.into(),
            detail: detail.into(),
        }
    }
}

/// The final research report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub executive_summary: String,
    pub findings: Vec<SubtaskFindings>,
    pub entity_roster: Vec<Entity>,
    pub limitations: Vec<Limitation>,
    /// Distinct cited URLs in first-use order.
    pub citations: Vec<String>,
    pub cost: CostSnapshot,
}

impl Report {
    /// A minimal report for degenerate runs.
    pub fn empty(question: &str) -> Self {
        Self {
            executive_summary: format!("No findings for: {question}"),
            findings: Vec::new(),
            entity_roster: Vec::new(),
            limitations: Vec::new(),
            citations: Vec::new(),
            cost: CostSnapshot::default(),
        }
    }

    /// Distinct URLs across findings, in first-use order.
    pub fn collect_citations(findings: &[SubtaskFindings]) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut citations = Vec::new();
        for finding in findings {
            for item in &finding.accepted_items {
                if seen.insert(item.url.clone()) {
                    citations.push(item.url.clone());
                }
            }
        }
        citations
    }

    /// Render the report as Markdown with inline URL citations.
    pub fn render_markdown(&self, question: &str) -> String {
        let mut md = String::new();
        md.push_str(&format!("# Research Report\n\n**Question:** {question}\n\n"));
        md.push_str("## Executive Summary\n\n");
        md.push_str(&self.executive_summary);
        md.push_str("\n\n## Findings\n\n");

        for finding in &self.findings {
            md.push_str(&format!(
                "### {} ({})\n\n",
                finding.description, finding.state
            ));
            if finding.accepted_items.is_empty() {
                md.push_str("No accepted evidence.\n\n");
                continue;
            }
            for item in &finding.accepted_items {
                md.push_str(&format!("- **{}** ({})", item.title, item.url));
                if !item.description.is_empty() {
                    let snippet: String = item.description.chars().take(200).collect();
                    md.push_str(&format!(" - {snippet}"));
                }
                md.push('\n');
            }
            md.push('\n');
        }

        if !self.entity_roster.is_empty() {
            md.push_str("## Entities\n\n");
            for entity in &self.entity_roster {
                md.push_str(&format!(
                    "- {} ({})\n",
                    entity.name,
                    serde_json::to_value(entity.entity_type)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_default()
                ));
            }
            md.push('\n');
        }

        if !self.limitations.is_empty() {
            md.push_str("## Limitations\n\n");
            for limitation in &self.limitations {
                match &limitation.source_id {
                    Some(source_id) => md.push_str(&format!(
                        "- `{}` [{}]: {}\n",
                        source_id, limitation.kind, limitation.detail
                    )),
                    None => md.push_str(&format!(
                        "- [{}]: {}\n",
                        limitation.kind, limitation.detail
                    )),
                }
            }
            md.push('\n');
        }

        md.push_str(&format!(
            "---\nLLM cost: ${:.4} across {} calls\n",
            self.cost.total_usd, self.cost.call_count
        ));
        md
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn findings() -> Vec<SubtaskFindings> {
        vec![
            SubtaskFindings {
                subtask_id: "t1".to_string(),
                description: "award history".to_string(),
                state: SubtaskState::Succeeded,
                accepted_items: vec![
                    Item::new("Award A", "https://x/a").with_description("desc"),
                    Item::new("Award B", "https://x/b"),
                ],
                sources_used: vec!["contracts".to_string()],
            },
            SubtaskFindings {
                subtask_id: "t2".to_string(),
                description: "press coverage".to_string(),
                state: SubtaskState::Succeeded,
                accepted_items: vec![Item::new("Story", "https://x/a")],
                sources_used: vec!["web-search".to_string()],
            },
        ]
    }

    #[test]
    fn test_citations_are_distinct_and_ordered() {
        let citations = Report::collect_citations(&findings());
        assert_eq!(citations, vec!["https://x/a", "https://x/b"]);
    }

    #[test]
    fn test_limitation_from_critical_failure() {
        let limitation = Limitation::for_source(&CriticalSourceFailure {
            source_id: "contracts".to_string(),
            attempts: 3,
            error_kinds: vec![SourceErrorKind::RateLimited],
        });
        assert_eq!(limitation.source_id.as_deref(), Some("contracts"));
        assert_eq!(limitation.kind, "rate_limited");
        assert!(limitation.detail.contains("all 3 attempts"));
    }

    #[test]
    fn test_markdown_includes_sections() {
        let findings = findings();
        let citations = Report::collect_citations(&findings);
        let report = Report {
            executive_summary: "Two awards located.".to_string(),
            findings,
            entity_roster: vec![super::super::entities::Entity::new(
                "Lockheed Martin",
                super::super::entities::EntityType::Organization,
            )],
            limitations: vec![Limitation::general("budget", "run hit the cost ceiling")],
            citations,
            cost: CostSnapshot::default(),
        };

        let md = report.render_markdown("who won the contracts?");
        assert!(md.contains("# Research Report"));
        assert!(md.contains("Two awards located."));
        assert!(md.contains("https://x/a"));
        assert!(md.contains("## Entities"));
        assert!(md.contains("Lockheed Martin (organization)"));
        assert!(md.contains("## Limitations"));
        assert!(md.contains("cost ceiling"));
    }
}
