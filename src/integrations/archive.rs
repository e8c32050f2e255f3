//! Local chat-export archive scanner.
//!
//! Scans on-disk JSON exports (one file per channel chunk) for messages
//! matching any of the generated keywords, scores each hit by the number
//! of distinct keywords matched, and returns results sorted by score
//! descending. Real-world exports are frequently mangled - trailing
//! commas, stray control characters - so decoding has a lenient repair
//! pass, and a corrupt file is logged once and skipped, never fatal.

use async_trait::async_trait;
use chrono::DateTime;
use glob::glob;
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

use crate::config::ResearchConfig;
use crate::error::Result;
use crate::llm::{FieldSpec, JsonSchema, LlmGateway};
use crate::prompts::PromptStore;

use super::query::fallback_keywords;
use super::types::{
    Item, QueryParams, QueryResult, Question, SourceCategory, SourceError, SourceMetadata,
};
use super::{generate_query_via_llm, relevant_field, Integration};

pub struct ArchiveIntegration {
    metadata: SourceMetadata,
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptStore>,
    root: PathBuf,
}

impl ArchiveIntegration {
    pub const ID: &'static str = "discord-archive";
    const DEFAULT_ROOT: &'static str = "archives/discord";

    pub fn new(
        gateway: &Arc<LlmGateway>,
        prompts: &Arc<PromptStore>,
        config: &ResearchConfig,
    ) -> Result<Self> {
        let source = config.source(Self::ID);
        Ok(Self {
            metadata: SourceMetadata::new(Self::ID, SourceCategory::LocalArchive)
                .with_typical_latency_ms(300),
            gateway: Arc::clone(gateway),
            prompts: Arc::clone(prompts),
            root: PathBuf::from(source.origin.unwrap_or_else(|| Self::DEFAULT_ROOT.to_string())),
        })
    }
}

fn trailing_comma_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r",\s*([}\]])").unwrap())
}

/// Decode possibly-mangled export JSON: direct parse first, then a repair
/// pass that strips control characters and trailing commas.
pub fn lenient_parse(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }

    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect();
    let repaired = trailing_comma_pattern().replace_all(&cleaned, "$1");
    serde_json::from_str(&repaired).ok()
}

/// One scored message hit inside a chunk.
struct ScoredMessage {
    item: Item,
    score: usize,
}

/// Scan a parsed chunk for messages matching any keyword (logical OR).
/// Score is the number of distinct keywords present in the content.
fn scan_chunk(path: &Path, chunk: &Value, keywords: &[String]) -> Vec<ScoredMessage> {
    let channel = chunk
        .pointer("/channel/name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".to_string())
        });

    let messages = chunk
        .get("messages")
        .and_then(Value::as_array)
        .or_else(|| chunk.as_array())
        .cloned()
        .unwrap_or_default();

    let lowered: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();

    messages
        .iter()
        .filter_map(|message| {
            let content = message.get("content").and_then(Value::as_str)?;
            let haystack = content.to_lowercase();
            let matched: Vec<&String> =
                lowered.iter().filter(|k| haystack.contains(*k)).collect();
            if matched.is_empty() {
                return None;
            }

            let author = message
                .pointer("/author/name")
                .and_then(Value::as_str)
                .or_else(|| message.get("author").and_then(Value::as_str))
                .unwrap_or("unknown");

            let url = match message.get("id").and_then(Value::as_str) {
                Some(id) => format!("archive://{channel}/{id}"),
                None => {
                    // No message id: derive a stable key from file + content.
                    let mut hasher = Sha256::new();
                    hasher.update(path.to_string_lossy().as_bytes());
                    hasher.update(content.as_bytes());
                    let digest = format!("{:x}", hasher.finalize());
                    format!("archive://{channel}/{}", &digest[..16])
                }
            };

            let snippet: String = content.chars().take(120).collect();
            let mut item = Item::new(format!("#{channel} - {author}"), url)
                .with_description(snippet)
                .with_author(author)
                .with_extra(json!({
                    "file": path.to_string_lossy(),
                    "matched_keywords": matched,
                    "content": content,
                }));
            if let Some(date) = message
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            {
                item = item.with_date(date.with_timezone(&chrono::Utc));
            }

            Some(ScoredMessage {
                item,
                score: matched.len(),
            })
        })
        .collect()
}

#[async_trait]
impl Integration for ArchiveIntegration {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn query_schema(&self) -> JsonSchema {
        JsonSchema::object(
            "archive_query",
            vec![FieldSpec::string_array("keywords"), relevant_field()],
        )
    }

    async fn generate_query(&self, question: &Question) -> Result<Option<QueryParams>> {
        let generated = generate_query_via_llm(
            &self.gateway,
            &self.prompts,
            "query/archive",
            question,
            &self.query_schema(),
        )
        .await?;

        Ok(generated.map(|mut params| {
            if params.get_str_array("keywords").is_empty() {
                params.insert("keywords", json!(fallback_keywords(&question.text, 6)));
            }
            params
        }))
    }

    async fn execute_search(
        &self,
        params: &QueryParams,
        _credential: Option<&str>,
        limit: usize,
    ) -> QueryResult {
        let started = Instant::now();
        let keywords = params.get_str_array("keywords");
        let pattern = format!("{}/**/*.json", self.root.display());

        let paths: Vec<PathBuf> = match glob(&pattern) {
            Ok(paths) => paths.filter_map(|p| p.ok()).collect(),
            Err(err) => {
                return QueryResult::failed(
                    Self::ID,
                    SourceError::transport(format!("bad archive glob: {err}")),
                    started.elapsed().as_millis() as u64,
                    Some(params.clone()),
                )
            }
        };

        let mut hits: Vec<ScoredMessage> = Vec::new();
        let mut total_matched = 0u64;
        for path in paths {
            let keywords = keywords.clone();
            let scan_path = path.clone();
            // File reads and the repair pass are blocking work.
            let scanned = tokio::task::spawn_blocking(move || {
                let text = std::fs::read_to_string(&scan_path).ok()?;
                let chunk = lenient_parse(&text)?;
                Some(scan_chunk(&scan_path, &chunk, &keywords))
            })
            .await;

            match scanned {
                Ok(Some(messages)) => {
                    total_matched += messages.len() as u64;
                    hits.extend(messages);
                }
                Ok(None) => {
                    warn!(file = %path.display(), "corrupt archive chunk skipped");
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "archive scan task failed");
                }
            }
        }

        hits.sort_by(|a, b| b.score.cmp(&a.score));
        let items: Vec<Item> = hits.into_iter().take(limit).map(|hit| hit.item).collect();

        QueryResult::ok(
            Self::ID,
            items,
            total_matched,
            started.elapsed().as_millis() as u64,
            Some(params.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lenient_parse_accepts_clean_json() {
        let value = lenient_parse(r#"{"messages": []}"#).unwrap();
        assert!(value["messages"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_lenient_parse_repairs_trailing_commas() {
        let mangled = r#"{"messages": [{"content": "Section 702 vote", "id": "1",},],}"#;
        let value = lenient_parse(mangled).unwrap();
        assert_eq!(value["messages"][0]["content"], "Section 702 vote");
    }

    #[test]
    fn test_lenient_parse_strips_control_characters() {
        let mangled = "{\"messages\": [{\"content\": \"ok\u{0001}\", \"id\": \"2\"}]}";
        assert!(lenient_parse(mangled).is_some());
    }

    #[test]
    fn test_lenient_parse_gives_up_on_garbage() {
        assert!(lenient_parse("not json at all {{{").is_none());
    }

    #[test]
    fn test_scan_scores_by_distinct_keyword_count() {
        let chunk = serde_json::json!({
            "channel": {"name": "natsec"},
            "messages": [
                {"id": "1", "content": "Section 702 renewal debate", "author": {"name": "ana"}},
                {"id": "2", "content": "Section 702 and FISA court both mentioned", "author": {"name": "bo"}},
                {"id": "3", "content": "unrelated chatter"},
            ],
        });

        let keywords = vec!["section 702".to_string(), "fisa".to_string()];
        let mut hits = scan_chunk(Path::new("chunk_001.json"), &chunk, &keywords);
        hits.sort_by(|a, b| b.score.cmp(&a.score));

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].score, 2);
        assert_eq!(hits[0].item.url, "archive://natsec/2");
        assert_eq!(hits[1].score, 1);
        assert_eq!(hits[0].item.title, "#natsec - bo");
    }

    #[test]
    fn test_scan_tolerates_top_level_array_and_missing_ids() {
        let chunk = serde_json::json!([
            {"content": "keyword here", "author": "plain-author"},
        ]);
        let hits = scan_chunk(Path::new("dump.json"), &chunk, &["keyword".to_string()]);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].item.url.starts_with("archive://dump/"));
        assert_eq!(hits[0].item.author.as_deref(), Some("plain-author"));
    }

    #[tokio::test]
    async fn test_execute_search_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("good.json"),
            r#"{"messages": [{"id": "1", "content": "reddit discussion of Section 702", "author": {"name": "sam"}}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("trailing.json"),
            r#"{"messages": [{"id": "2", "content": "more Section 702 talk",},]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("corrupt.json"), "}{ hopeless").unwrap();

        let gateway = Arc::new(LlmGateway::new(
            crate::config::LlmConfig::default(),
            &crate::config::CostConfig::default(),
        ));
        let prompts = Arc::new(PromptStore::new("prompts", 30));
        let mut config = ResearchConfig::new();
        config
            .sources
            .get_mut(ArchiveIntegration::ID)
            .unwrap()
            .origin = Some(dir.path().to_string_lossy().into_owned());

        let integration = ArchiveIntegration::new(&gateway, &prompts, &config).unwrap();
        let params = QueryParams::from_value(serde_json::json!({
            "keywords": ["section 702"]
        }))
        .unwrap();

        let result = integration.execute_search(&params, None, 10).await;
        assert!(result.success);
        // Both parseable files contribute; the corrupt one is skipped.
        assert_eq!(result.items.len(), 2);
    }
}
