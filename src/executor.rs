//! Parallel dispatch of subtask-source pairs.
//!
//! Fan-out is bounded twice: a global semaphore caps total in-flight
//! upstream requests, and a lazily-created per-source semaphore caps each
//! source individually (some government APIs refuse requests under
//! parallel load). The stricter limit dominates because both permits are
//! held for the duration of a search.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error};

use crate::config::ResearchConfig;
use crate::integrations::{
    IntegrationRegistry, QueryParams, QueryResult, Question, SourceError, SourceErrorKind,
};

/// Dispatches one subtask to many sources with bounded parallelism.
pub struct ParallelExecutor {
    registry: Arc<IntegrationRegistry>,
    config: Arc<ResearchConfig>,
    global: Arc<Semaphore>,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ParallelExecutor {
    pub fn new(registry: Arc<IntegrationRegistry>, config: Arc<ResearchConfig>) -> Self {
        let global = Arc::new(Semaphore::new(config.execution.max_concurrent_total));
        Self {
            registry,
            config,
            global,
            per_source: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatch `question` to every source, concurrently. The returned
    /// pairs preserve the insertion order of `sources`; a failure on one
    /// source never fails the batch.
    pub async fn execute(
        &self,
        question: &Question,
        sources: &[String],
        limit: usize,
    ) -> Vec<(String, QueryResult)> {
        let dispatches = sources
            .iter()
            .map(|source_id| self.dispatch_one(question, source_id, limit));
        futures::future::join_all(dispatches).await
    }

    /// Re-run a single source with explicit parameters, under the same
    /// concurrency and timeout rules. Used by the reformulation loop.
    pub async fn execute_single(
        &self,
        source_id: &str,
        params: &QueryParams,
        limit: usize,
    ) -> QueryResult {
        let started = Instant::now();
        let integration = match self.registry.get(source_id) {
            Ok(integration) => integration,
            Err(err) => {
                return QueryResult::failed(
                    source_id,
                    SourceError::transport(format!("source unavailable: {err}")),
                    started.elapsed().as_millis() as u64,
                    Some(params.clone()),
                )
            }
        };

        let credential = match self.resolve_credential(source_id, integration.metadata()) {
            Ok(credential) => credential,
            Err(result) => return result,
        };

        self.bounded_search(source_id, integration.as_ref(), params, credential, limit)
            .await
    }

    async fn dispatch_one(
        &self,
        question: &Question,
        source_id: &str,
        limit: usize,
    ) -> (String, QueryResult) {
        let started = Instant::now();
        let elapsed_ms = |s: Instant| s.elapsed().as_millis() as u64;

        let integration = match self.registry.get(source_id) {
            Ok(integration) => integration,
            Err(err) => {
                return (
                    source_id.to_string(),
                    QueryResult::failed(
                        source_id,
                        SourceError::transport(format!("source unavailable: {err}")),
                        elapsed_ms(started),
                        None,
                    ),
                )
            }
        };

        if !integration.is_relevant(question) {
            debug!(source_id, "integration statically irrelevant, skipping");
            return (
                source_id.to_string(),
                QueryResult::failed(
                    source_id,
                    SourceError::new(
                        SourceErrorKind::QueryGenOptOut,
                        "statically irrelevant to this question",
                    ),
                    elapsed_ms(started),
                    None,
                ),
            );
        }

        let params = match integration.generate_query(question).await {
            Ok(Some(params)) => params,
            Ok(None) => {
                // Opt-outs are logged at error severity so a selector that
                // keeps picking a source that declines stands out in runs.
                error!(source_id, question = %question.text, "query generation opted out");
                return (
                    source_id.to_string(),
                    QueryResult::failed(
                        source_id,
                        SourceError::new(
                            SourceErrorKind::QueryGenOptOut,
                            "integration opted out of this question",
                        ),
                        elapsed_ms(started),
                        None,
                    ),
                );
            }
            Err(err) => {
                error!(source_id, error = %err, "query generation failed");
                return (
                    source_id.to_string(),
                    QueryResult::failed(
                        source_id,
                        SourceError::new(SourceErrorKind::QueryGenFailed, err.to_string()),
                        elapsed_ms(started),
                        None,
                    ),
                );
            }
        };

        let credential = match self.resolve_credential(source_id, integration.metadata()) {
            Ok(credential) => credential,
            Err(result) => return (source_id.to_string(), result),
        };

        let result = self
            .bounded_search(source_id, integration.as_ref(), &params, credential, limit)
            .await;
        (source_id.to_string(), result)
    }

    /// Acquire both permits, run the search under the source timeout.
    async fn bounded_search(
        &self,
        source_id: &str,
        integration: &dyn crate::integrations::Integration,
        params: &QueryParams,
        credential: Option<String>,
        limit: usize,
    ) -> QueryResult {
        let started = Instant::now();

        let _global = self.global.acquire().await.expect("global semaphore closed");
        let source_semaphore = self.source_semaphore(source_id).await;
        let _source = source_semaphore
            .acquire()
            .await
            .expect("source semaphore closed");

        let timeout_secs = self.config.source_timeout(source_id);
        match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            integration.execute_search(params, credential.as_deref(), limit),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => QueryResult::failed(
                source_id,
                SourceError::timeout(format!("no response within {timeout_secs}s")),
                started.elapsed().as_millis() as u64,
                Some(params.clone()),
            ),
        }
    }

    fn resolve_credential(
        &self,
        source_id: &str,
        metadata: &crate::integrations::SourceMetadata,
    ) -> std::result::Result<Option<String>, QueryResult> {
        if !metadata.requires_credential {
            return Ok(None);
        }

        let env_name = self
            .config
            .source(source_id)
            .credential_env_name
            .or_else(|| metadata.credential_env_name.clone());

        match env_name.as_deref().map(std::env::var) {
            Some(Ok(value)) if !value.is_empty() => Ok(Some(value)),
            _ => Err(QueryResult::failed(
                source_id,
                SourceError::new(
                    SourceErrorKind::MissingCredential,
                    format!(
                        "credential env var {} is not set",
                        env_name.as_deref().unwrap_or("(unnamed)")
                    ),
                ),
                0,
                None,
            )),
        }
    }

    async fn source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut semaphores = self.per_source.lock().await;
        Arc::clone(semaphores.entry(source_id.to_string()).or_insert_with(|| {
            Arc::new(Semaphore::new(self.config.source_concurrency(source_id)))
        }))
    }
}
