//! The deep-research orchestrator.
//!
//! One engine invocation runs the investigative loop:
//! 1. DECOMPOSE: question into 3-8 focused subtasks
//! 2. SELECT: sources per subtask, biased toward authoritative APIs
//! 3. DISPATCH: parallel, rate-limited queries through the executor
//! 4. FILTER: adaptive relevance scoring with bounded reformulation
//! 5. EXTRACT: entities from accepted evidence
//! 6. FOLLOW UP: additional subtasks within the task budget
//! 7. SYNTHESIZE: a cited report with explicit limitations
//!
//! Every step appends to the run's execution log before the next begins.

mod entities;
mod relevance;
mod report;
mod sensitivity;
mod types;

pub use entities::{Entity, EntityRelationship, EntityType};
pub use relevance::{decide, relevance_schema, threshold_for, Decision, RelevanceVerdict};
pub use report::{Limitation, Report, SubtaskFindings};
pub use sensitivity::classify;
pub use types::{CriticalSourceFailure, RunRecord, Subtask, SubtaskState};

use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{read_event_log, ExecutionEvent, ExecutionLogger};
use crate::config::{Operation, ResearchConfig};
use crate::error::{Error, Result};
use crate::executor::ParallelExecutor;
use crate::integrations::{
    default_registry, IntegrationRegistry, Item, QueryParams, QueryResult, Question, Sensitivity,
    SourceCategory, SourceStatus,
};
use crate::llm::{CostSnapshot, FieldSpec, JsonSchema, LlmGateway};
use crate::prompts::PromptStore;

use entities::{decode_entities, entity_schema, merge_entities, sample_items};

/// A boxed, finite stream of execution events; completes with the run.
pub type EventStream = Pin<Box<dyn Stream<Item = ExecutionEvent> + Send>>;

/// The orchestrator. Holds process-wide services (gateway, registry,
/// prompt store); per-run state lives on the stack of `run_research`.
pub struct DeepResearchEngine {
    config: Arc<ResearchConfig>,
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptStore>,
    registry: Arc<IntegrationRegistry>,
    live_runs: std::sync::Mutex<HashMap<String, Arc<ExecutionLogger>>>,
}

impl DeepResearchEngine {
    /// Build an engine with the crate's built-in integrations.
    pub fn new(config: ResearchConfig, gateway: Arc<LlmGateway>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let prompts = Arc::new(PromptStore::new(
            &config.engine.prompt_root,
            config.engine.recent_window_days,
        ));
        let registry = Arc::new(default_registry(&config, &gateway, &prompts));
        Ok(Self {
            config,
            gateway,
            prompts,
            registry,
            live_runs: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Build an engine around an explicit registry and prompt store.
    pub fn with_registry(
        config: ResearchConfig,
        gateway: Arc<LlmGateway>,
        prompts: Arc<PromptStore>,
        registry: Arc<IntegrationRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            gateway,
            prompts,
            registry,
            live_runs: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Registered sources and their status, in registration order.
    pub fn list_sources(&self) -> Vec<SourceStatus> {
        self.registry.statuses()
    }

    /// Observe a run's event stream. For a live run this follows events as
    /// they are appended and completes when the run does; for a finished
    /// run it replays the persisted log.
    pub fn stream_progress(&self, run_id: &str) -> EventStream {
        let live = self
            .live_runs
            .lock()
            .expect("live runs lock poisoned")
            .get(run_id)
            .cloned();

        match live {
            Some(logger) => {
                let rx = logger.subscribe();
                Box::pin(futures::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|event| (event, rx))
                }))
            }
            None => {
                let run_dir = self.config.engine.output_root.join(run_id);
                Box::pin(
                    futures::stream::once(async move {
                        read_event_log(&run_dir).await.unwrap_or_default()
                    })
                    .map(futures::stream::iter)
                    .flatten(),
                )
            }
        }
    }

    /// Run the investigative loop for one question.
    ///
    /// Always returns a `RunRecord` with a report when the run directory is
    /// writable; engine-level LLM failures degrade rather than abort.
    pub async fn run_research(
        &self,
        question: Question,
        config_overrides: Option<Value>,
    ) -> Result<RunRecord> {
        let config = match &config_overrides {
            Some(overrides) => self.config.merged_with(overrides)?,
            None => (*self.config).clone(),
        };
        config.validate()?;
        let config = Arc::new(config);

        let run_id = format!("run-{}", Uuid::new_v4());
        let started_at = Utc::now();
        let logger =
            Arc::new(ExecutionLogger::create(&config.engine.output_root, &run_id).await?);
        self.live_runs
            .lock()
            .expect("live runs lock poisoned")
            .insert(run_id.clone(), Arc::clone(&logger));

        let outcome = self
            .run_inner(&run_id, question, Arc::clone(&config), Arc::clone(&logger), started_at)
            .await;

        // Release file handles and hang up progress subscribers on every
        // exit path.
        if let Err(err) = logger.finish().await {
            warn!(run_id = %run_id, error = %err, "failed to finalize execution log");
        }
        self.live_runs
            .lock()
            .expect("live runs lock poisoned")
            .remove(&run_id);

        outcome
    }

    async fn run_inner(
        &self,
        run_id: &str,
        question: Question,
        config: Arc<ResearchConfig>,
        logger: Arc<ExecutionLogger>,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<RunRecord> {
        let sensitivity = question
            .sensitivity
            .unwrap_or_else(|| classify(&question.text));
        let cost_baseline = self.gateway.cost_snapshot();

        let state = RunState {
            config: Arc::clone(&config),
            executor: ParallelExecutor::new(Arc::clone(&self.registry), Arc::clone(&config)),
            logger,
            deadline: Instant::now()
                + Duration::from_secs(config.execution.max_time_minutes * 60),
            sensitivity,
            threshold: threshold_for(sensitivity, &config.engine),
            accepted_urls: Mutex::new(HashSet::new()),
            source_stats: Mutex::new(HashMap::new()),
            budget_stop: AtomicBool::new(false),
        };

        info!(run_id, sensitivity = %sensitivity, "research run started");
        state
            .emit(ExecutionEvent::run_start(
                run_id,
                &question.text,
                &sensitivity.to_string(),
            ))
            .await;

        let mut limitations: Vec<Limitation> = Vec::new();
        let mut pending = self
            .decompose_or_wrap(&state, &question, &mut limitations)
            .await;
        pending.truncate(config.execution.max_tasks);
        let mut next_id = pending.len() + 1;

        let mut completed: Vec<Subtask> = Vec::new();
        let mut findings: Vec<SubtaskFindings> = Vec::new();
        let mut roster: Vec<Entity> = Vec::new();
        let mut roster_covered_items = 0usize;
        let mut followups_done = false;
        let mut followup_ids: HashSet<String> = HashSet::new();

        loop {
            if pending.is_empty() {
                if followups_done || completed.len() >= config.execution.max_tasks {
                    break;
                }
                followups_done = true;

                if !config.engine.entity_extraction_per_subtask {
                    let all_items = collect_accepted(&findings);
                    roster_covered_items = all_items.len();
                    roster = self.extract_entities(&state, &all_items).await;
                }

                let remaining = config.execution.max_tasks - completed.len();
                for description in self
                    .generate_followups(&state, &question, &roster, &completed)
                    .await
                    .into_iter()
                    .take(remaining)
                {
                    let id = format!("t{next_id}");
                    next_id += 1;
                    followup_ids.insert(id.clone());
                    pending.push_back(Subtask::new(id, description));
                }
                if pending.is_empty() {
                    break;
                }
            }

            if state.deadline_passed() || state.budget_stopped() {
                let (kind, detail) = if state.budget_stopped() {
                    ("budget", "run cost ceiling reached; remaining subtasks abandoned")
                } else {
                    ("deadline", "run deadline reached; remaining subtasks abandoned")
                };
                limitations.push(Limitation::general(kind, detail));
                while let Some(mut subtask) = pending.pop_front() {
                    subtask.state = SubtaskState::Abandoned;
                    state
                        .emit(ExecutionEvent::task_complete(&subtask.id, "abandoned", 0))
                        .await;
                    completed.push(subtask);
                }
                break;
            }

            let mut batch = Vec::new();
            while batch.len() < config.execution.batch_size() {
                match pending.pop_front() {
                    Some(subtask) => batch.push(subtask),
                    None => break,
                }
            }

            let dispatches = batch.into_iter().map(|subtask| {
                let is_followup = followup_ids.contains(&subtask.id);
                self.process_subtask(&state, subtask, is_followup)
            });
            for (subtask, finding) in futures::future::join_all(dispatches).await {
                if config.engine.entity_extraction_per_subtask {
                    let extracted = self
                        .extract_entities(&state, &finding.accepted_items)
                        .await;
                    merge_entities(&mut roster, extracted);
                }
                completed.push(subtask);
                findings.push(finding);
            }
        }

        // Refresh the roster when follow-ups contributed evidence the
        // first extraction pass never saw.
        if !config.engine.entity_extraction_per_subtask {
            let all_items = collect_accepted(&findings);
            if all_items.len() != roster_covered_items && !state.budget_stopped() {
                roster = self.extract_entities(&state, &all_items).await;
            }
        }

        let critical = state.critical_failures().await;
        for failure in &critical {
            state
                .emit(ExecutionEvent::critical_source_failure(
                    &failure.source_id,
                    failure.attempts,
                    &failure.error_kinds,
                ))
                .await;
            limitations.push(Limitation::for_source(failure));
        }

        let total_accepted: usize = findings.iter().map(|f| f.accepted_items.len()).sum();
        if total_accepted == 0 {
            limitations.push(Limitation::general(
                "no_results",
                "no source yielded accepted items for any subtask",
            ));
        }

        let mut report = self
            .synthesize(&question, &findings, roster, limitations)
            .await;
        report.cost = self.gateway.cost_snapshot().delta_since(&cost_baseline);

        let run_dir = state.logger.run_dir().to_path_buf();
        tokio::fs::write(
            run_dir.join("report.json"),
            serde_json::to_vec_pretty(&report)?,
        )
        .await?;
        tokio::fs::write(
            run_dir.join("report.md"),
            report.render_markdown(&question.text),
        )
        .await?;

        let record = RunRecord {
            run_id: run_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            question,
            config_snapshot: serde_json::to_value(&*config)?,
            subtasks: completed,
            cost: report.cost.clone(),
            critical_source_failures: critical,
            report,
        };

        state
            .emit(ExecutionEvent::run_complete(
                run_id,
                record.succeeded(),
                record.cost.total_usd,
            ))
            .await;
        info!(run_id, succeeded = record.succeeded(), "research run finished");
        Ok(record)
    }

    /// Decompose the question, degrading to a single wrapped subtask on
    /// empty input, short decompositions, or LLM failure.
    async fn decompose_or_wrap(
        &self,
        state: &RunState,
        question: &Question,
        limitations: &mut Vec<Limitation>,
    ) -> VecDeque<Subtask> {
        if question.text.trim().is_empty() {
            limitations.push(Limitation::general(
                "degenerate_input",
                "question was empty; nothing to decompose",
            ));
            return VecDeque::from(vec![Subtask::new("t1", "(empty)")]);
        }

        let schema = JsonSchema::object(
            "decomposition",
            vec![FieldSpec::object_array(
                "subtasks",
                vec![
                    FieldSpec::string("description"),
                    FieldSpec::string("source_hint").optional(),
                ],
            )],
        );

        let decomposed = async {
            let prompt = self
                .prompts
                .render("decompose", &[("question", &question.text)])?;
            self.gateway
                .complete(&prompt, &schema, Operation::Decomposition, None)
                .await
        }
        .await;

        match decomposed {
            Ok(value) => {
                let subtasks: Vec<Subtask> = value["subtasks"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .take(8)
                    .enumerate()
                    .filter_map(|(i, entry)| {
                        let description = entry.get("description")?.as_str()?;
                        let mut subtask = Subtask::new(format!("t{}", i + 1), description);
                        if let Some(hint) = entry.get("source_hint").and_then(Value::as_str) {
                            subtask = subtask.with_source_hint(hint);
                        }
                        Some(subtask)
                    })
                    .collect();

                if subtasks.len() >= 2 {
                    VecDeque::from(subtasks)
                } else {
                    state
                        .emit(ExecutionEvent::progress(
                            "decomposition yielded fewer than 2 subtasks; wrapping question",
                        ))
                        .await;
                    VecDeque::from(vec![Subtask::new("t1", question.text.clone())])
                }
            }
            Err(err) => {
                if err.is_budget_stop() {
                    state.budget_stop.store(true, Ordering::Relaxed);
                }
                warn!(error = %err, "decomposition failed; wrapping question as single subtask");
                limitations.push(Limitation::general(
                    "decomposition",
                    format!("decomposition degraded to a single subtask: {err}"),
                ));
                VecDeque::from(vec![Subtask::new("t1", question.text.clone())])
            }
        }
    }

    async fn process_subtask(
        &self,
        state: &RunState,
        mut subtask: Subtask,
        is_followup: bool,
    ) -> (Subtask, SubtaskFindings) {
        subtask.state = SubtaskState::Running;
        let sub_question =
            Question::new(subtask.description.clone()).with_sensitivity(state.sensitivity);

        let sources = self.select_sources(state, &subtask, is_followup).await;
        state
            .emit(ExecutionEvent::source_selection(&subtask.id, &sources))
            .await;

        let limit = state.config.execution.default_result_limit;
        let results = state.executor.execute(&sub_question, &sources, limit).await;

        let mut accepted = Vec::new();
        let mut sources_used = Vec::new();
        for (source_id, result) in results {
            let kept = self
                .filter_source_result(state, &mut subtask, &source_id, result, limit)
                .await;
            if !kept.is_empty() {
                sources_used.push(source_id);
                accepted.extend(kept);
            }
            if state.budget_stopped() || state.deadline_passed() {
                break;
            }
        }

        subtask.state = if accepted.is_empty() {
            SubtaskState::Failed
        } else {
            SubtaskState::Succeeded
        };
        state
            .emit(ExecutionEvent::task_complete(
                &subtask.id,
                &subtask.state.to_string(),
                accepted.len(),
            ))
            .await;

        let finding = SubtaskFindings {
            subtask_id: subtask.id.clone(),
            description: subtask.description.clone(),
            state: subtask.state,
            accepted_items: accepted,
            sources_used,
        };
        (subtask, finding)
    }

    /// Score one source's result set, accepting, rejecting, or driving the
    /// bounded reformulation loop. Returns the items that survived.
    async fn filter_source_result(
        &self,
        state: &RunState,
        subtask: &mut Subtask,
        source_id: &str,
        mut result: QueryResult,
        limit: usize,
    ) -> Vec<Item> {
        let mut attempt: u32 = 0;
        let search_started = Instant::now();
        let total_search = Duration::from_secs(state.config.timeouts.total_search);
        loop {
            state.record_attempt(source_id, &result).await;
            let params_json = result
                .query_params
                .as_ref()
                .map(QueryParams::to_value)
                .unwrap_or(Value::Null);
            state
                .emit(ExecutionEvent::api_call(
                    &subtask.id, source_id, attempt, &params_json,
                ))
                .await;
            if let Ok(raw) = serde_json::to_value(&result) {
                if let Ok(raw_key) = state
                    .logger
                    .store_raw(&subtask.id, source_id, attempt, &raw)
                    .await
                {
                    state
                        .emit(ExecutionEvent::raw_response(
                            &subtask.id,
                            source_id,
                            attempt,
                            &raw_key,
                            result.items.len(),
                        ))
                        .await;
                }
            }

            if !result.success || result.items.is_empty() {
                return Vec::new();
            }

            let verdict = match self
                .score_relevance(&subtask.description, source_id, &result.items)
                .await
            {
                Ok(verdict) => verdict,
                Err(err) if err.is_budget_stop() => {
                    state.budget_stop.store(true, Ordering::Relaxed);
                    return Vec::new();
                }
                Err(err) => {
                    // Keep the evidence rather than losing it to a scoring
                    // outage; the log records that it went unscored.
                    warn!(source_id, error = %err, "relevance scoring unavailable; accepting unscored");
                    state
                        .emit(ExecutionEvent::progress(format!(
                            "relevance scoring unavailable for {source_id}; items accepted unscored"
                        )))
                        .await;
                    return state.dedupe_accept(result.items).await;
                }
            };

            state
                .emit(ExecutionEvent::relevance_scoring(
                    &subtask.id,
                    source_id,
                    verdict.score,
                    state.threshold,
                    &verdict.rationale,
                ))
                .await;

            let decision = decide(
                verdict.score,
                state.threshold,
                subtask.retry_count,
                state.config.execution.max_retries_per_task,
            );
            match decision {
                Decision::Accept => {
                    let kept = state.dedupe_accept(result.items).await;
                    state
                        .emit(ExecutionEvent::filter_decision(
                            &subtask.id,
                            source_id,
                            "accept",
                            kept.len(),
                        ))
                        .await;
                    return kept;
                }
                Decision::Reject => {
                    state
                        .emit(ExecutionEvent::filter_decision(
                            &subtask.id, source_id, "reject", 0,
                        ))
                        .await;
                    return Vec::new();
                }
                Decision::Reformulate => {
                    subtask.retry_count += 1;
                    state
                        .emit(ExecutionEvent::filter_decision(
                            &subtask.id,
                            source_id,
                            "reformulate",
                            0,
                        ))
                        .await;
                    // Three separate bounds stop this loop: the per-result
                    // refinement cap, the whole-search timeout, and the
                    // run deadline.
                    if attempt >= state.config.execution.max_refinements
                        || search_started.elapsed() >= total_search
                        || state.deadline_passed()
                    {
                        return Vec::new();
                    }

                    let reformulated = self
                        .reformulate(&subtask.description, source_id, &result, &verdict)
                        .await;
                    let params = match reformulated {
                        Ok(params) => params,
                        Err(err) => {
                            if err.is_budget_stop() {
                                state.budget_stop.store(true, Ordering::Relaxed);
                            }
                            warn!(source_id, error = %err, "reformulation failed");
                            return Vec::new();
                        }
                    };

                    attempt += 1;
                    result = state.executor.execute_single(source_id, &params, limit).await;
                }
            }
        }
    }

    /// Choose sources for a subtask via the selection prompt, intersected
    /// with registry availability. Falls back to every enabled source.
    async fn select_sources(
        &self,
        state: &RunState,
        subtask: &Subtask,
        is_followup: bool,
    ) -> Vec<String> {
        let mut available: Vec<String> = Vec::new();
        for id in self.registry.list_enabled() {
            let Ok(integration) = self.registry.get(&id) else {
                continue;
            };
            let category = integration.metadata().category;
            if is_followup
                && !state.config.engine.allow_browser_followups
                && category == SourceCategory::BrowserScraper
            {
                continue;
            }
            available.push(id);
        }
        if available.is_empty() {
            return available;
        }

        let catalog: Vec<Value> = available
            .iter()
            .filter_map(|id| self.registry.get(id).ok())
            .map(|integration| {
                let metadata = integration.metadata();
                json!({
                    "id": metadata.id,
                    "category": metadata.category,
                    "cost_estimate_per_query": metadata.cost_estimate_per_query,
                    "typical_latency_ms": metadata.typical_latency_ms,
                })
            })
            .collect();

        let schema = JsonSchema::object(
            "source_selection",
            vec![FieldSpec::string_array("sources")],
        );
        let selection = async {
            let prompt = self.prompts.render(
                "select_sources",
                &[
                    ("subtask", &subtask.description),
                    ("sources_json", &serde_json::to_string(&catalog)?),
                ],
            )?;
            self.gateway
                .complete(&prompt, &schema, Operation::SourceSelection, None)
                .await
        }
        .await;

        let mut selected: Vec<String> = match selection {
            Ok(value) => value["sources"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .filter(|id| available.iter().any(|a| a == id))
                .map(str::to_string)
                .collect(),
            Err(err) => {
                if err.is_budget_stop() {
                    state.budget_stop.store(true, Ordering::Relaxed);
                    return Vec::new();
                }
                warn!(error = %err, "source selection failed; using all enabled sources");
                Vec::new()
            }
        };

        if selected.is_empty() {
            selected = available.clone();
        }

        // Honor the decomposition's hint by trying that source first.
        if let Some(hint) = &subtask.source_hint {
            if available.contains(hint) && !selected.contains(hint) {
                selected.insert(0, hint.clone());
            } else if let Some(pos) = selected.iter().position(|id| id == hint) {
                selected.remove(pos);
                selected.insert(0, hint.clone());
            }
        }
        selected
    }

    async fn score_relevance(
        &self,
        subtask_description: &str,
        source_id: &str,
        items: &[Item],
    ) -> Result<RelevanceVerdict> {
        let items_json = serde_json::to_string(&sample_items(items, 20, 240))?;
        let prompt = self.prompts.render(
            "relevance",
            &[
                ("subtask", subtask_description),
                ("source_id", source_id),
                ("items_json", &items_json),
            ],
        )?;
        let value = self
            .gateway
            .complete(&prompt, &relevance_schema(), Operation::Relevance, None)
            .await?;

        let score = value["score"].as_u64().unwrap_or(0).min(10) as u8;
        let rationale = value["rationale"].as_str().unwrap_or_default().to_string();
        Ok(RelevanceVerdict { score, rationale })
    }

    /// Produce new query params for a below-threshold source, constrained
    /// by that integration's own schema.
    async fn reformulate(
        &self,
        subtask_description: &str,
        source_id: &str,
        previous: &QueryResult,
        verdict: &RelevanceVerdict,
    ) -> Result<QueryParams> {
        let integration = self.registry.get(source_id)?;
        let mut schema = integration.query_schema();
        // The opt-out field is a generation-time concern; a reformulation
        // that omits it is fine.
        for field in &mut schema.fields {
            if field.name == "relevant" {
                field.required = false;
            }
        }

        let previous_params = previous
            .query_params
            .as_ref()
            .map(QueryParams::to_value)
            .unwrap_or(Value::Null);
        let items_sample = serde_json::to_string(&sample_items(&previous.items, 5, 120))?;

        let prompt = self.prompts.render(
            "reformulate",
            &[
                ("subtask", subtask_description),
                ("source_id", source_id),
                ("previous_params", &previous_params.to_string()),
                ("items_sample", &items_sample),
                ("reason", &verdict.rationale),
            ],
        )?;
        let mut value = self
            .gateway
            .complete(&prompt, &schema, Operation::Reformulation, None)
            .await?;
        if let Some(object) = value.as_object_mut() {
            object.remove("relevant");
        }

        QueryParams::from_value(value)
            .ok_or_else(|| Error::llm_parse("reformulation did not produce an object"))
    }

    /// Extract entities from a bounded sample of accepted items. Failures
    /// are non-fatal and yield an empty set.
    async fn extract_entities(&self, state: &RunState, items: &[Item]) -> Vec<Entity> {
        if items.is_empty() {
            return Vec::new();
        }

        let rich = state.config.engine.rich_entities;
        let template = if rich { "entities_rich" } else { "entities" };
        let extraction = async {
            let items_json = serde_json::to_string(&sample_items(items, 40, 240))?;
            let prompt = self
                .prompts
                .render(template, &[("items_json", &items_json)])?;
            self.gateway
                .complete(
                    &prompt,
                    &entity_schema(rich),
                    Operation::EntityExtraction,
                    None,
                )
                .await
        }
        .await;

        match extraction {
            Ok(value) => decode_entities(&value),
            Err(err) => {
                if err.is_budget_stop() {
                    state.budget_stop.store(true, Ordering::Relaxed);
                }
                warn!(error = %err, "entity extraction failed; continuing with empty set");
                Vec::new()
            }
        }
    }

    /// Propose follow-up subtasks from the entity roster and the state of
    /// completed work. Follow-ups inherit the run's sensitivity.
    async fn generate_followups(
        &self,
        state: &RunState,
        question: &Question,
        roster: &[Entity],
        completed: &[Subtask],
    ) -> Vec<String> {
        if state.budget_stopped() || state.deadline_passed() {
            return Vec::new();
        }

        let schema = JsonSchema::object(
            "followups",
            vec![FieldSpec::string_array("subtasks")],
        );
        let generated = async {
            let subtask_states: Vec<Value> = completed
                .iter()
                .map(|s| json!({"description": s.description, "state": s.state}))
                .collect();
            let remaining = state
                .config
                .execution
                .max_tasks
                .saturating_sub(completed.len())
                .to_string();
            let prompt = self.prompts.render(
                "followups",
                &[
                    ("question", &question.text),
                    ("entities_json", &serde_json::to_string(roster)?),
                    ("subtasks_json", &serde_json::to_string(&subtask_states)?),
                    ("remaining", &remaining),
                ],
            )?;
            self.gateway
                .complete(&prompt, &schema, Operation::Followups, None)
                .await
        }
        .await;

        match generated {
            Ok(value) => value["subtasks"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Err(err) => {
                if err.is_budget_stop() {
                    state.budget_stop.store(true, Ordering::Relaxed);
                }
                warn!(error = %err, "follow-up generation failed");
                Vec::new()
            }
        }
    }

    /// Compose the report. The executive summary is the only LLM-written
    /// part; with zero accepted evidence the call is skipped entirely.
    async fn synthesize(
        &self,
        question: &Question,
        findings: &[SubtaskFindings],
        entity_roster: Vec<Entity>,
        limitations: Vec<Limitation>,
    ) -> Report {
        let citations = Report::collect_citations(findings);
        let total_accepted: usize = findings.iter().map(|f| f.accepted_items.len()).sum();

        let executive_summary = if total_accepted == 0 {
            format!(
                "No accepted evidence was found for: {}. See limitations.",
                question.text
            )
        } else {
            let schema = JsonSchema::object(
                "synthesis",
                vec![FieldSpec::string("executive_summary")],
            );
            let summarized = async {
                let findings_json: Vec<Value> = findings
                    .iter()
                    .map(|f| {
                        json!({
                            "subtask": f.description,
                            "state": f.state,
                            "items": sample_items(&f.accepted_items, 10, 200),
                        })
                    })
                    .collect();
                let prompt = self.prompts.render(
                    "synthesis",
                    &[
                        ("question", &question.text),
                        ("findings_json", &serde_json::to_string(&findings_json)?),
                        ("limitations_json", &serde_json::to_string(&limitations)?),
                    ],
                )?;
                self.gateway
                    .complete(&prompt, &schema, Operation::Synthesis, None)
                    .await
            }
            .await;

            match summarized {
                Ok(value) => value["executive_summary"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                Err(err) => {
                    warn!(error = %err, "synthesis failed; falling back to a data-only summary");
                    format!(
                        "Research collected {} accepted items across {} subtasks for: {}. \
                         Narrative synthesis was unavailable ({err}).",
                        total_accepted,
                        findings.len(),
                        question.text
                    )
                }
            }
        };

        Report {
            executive_summary,
            findings: findings.to_vec(),
            entity_roster,
            limitations,
            citations,
            cost: CostSnapshot::default(),
        }
    }
}

/// Mutable per-run state shared by the subtask workers.
struct RunState {
    config: Arc<ResearchConfig>,
    executor: ParallelExecutor,
    logger: Arc<ExecutionLogger>,
    deadline: Instant,
    sensitivity: Sensitivity,
    threshold: u8,
    accepted_urls: Mutex<HashSet<String>>,
    source_stats: Mutex<HashMap<String, SourceStats>>,
    budget_stop: AtomicBool,
}

#[derive(Default)]
struct SourceStats {
    attempts: u32,
    successes: u32,
    error_kinds: Vec<crate::integrations::SourceErrorKind>,
}

impl RunState {
    /// Append to the audit log; logging problems are reported but never
    /// interrupt the run.
    async fn emit(&self, event: ExecutionEvent) {
        if let Err(err) = self.logger.log(&event).await {
            warn!(error = %err, "failed to append execution event");
        }
    }

    fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn budget_stopped(&self) -> bool {
        self.budget_stop.load(Ordering::Relaxed)
    }

    /// Run-wide URL dedupe: returns only items whose URL was not already
    /// accepted by any subtask.
    async fn dedupe_accept(&self, items: Vec<Item>) -> Vec<Item> {
        let mut seen = self.accepted_urls.lock().await;
        items
            .into_iter()
            .filter(|item| seen.insert(item.url.clone()))
            .collect()
    }

    async fn record_attempt(&self, source_id: &str, result: &QueryResult) {
        let mut stats = self.source_stats.lock().await;
        let entry = stats.entry(source_id.to_string()).or_default();
        entry.attempts += 1;
        if result.success {
            entry.successes += 1;
        } else if let Some(kind) = result.error_kind() {
            if !entry.error_kinds.contains(&kind) {
                entry.error_kinds.push(kind);
            }
        }
    }

    /// Sources that were dispatched at least once and never succeeded.
    async fn critical_failures(&self) -> Vec<CriticalSourceFailure> {
        let stats = self.source_stats.lock().await;
        let mut failures: Vec<CriticalSourceFailure> = stats
            .iter()
            .filter(|(_, s)| s.attempts > 0 && s.successes == 0)
            .map(|(source_id, s)| CriticalSourceFailure {
                source_id: source_id.clone(),
                attempts: s.attempts,
                error_kinds: s.error_kinds.clone(),
            })
            .collect();
        failures.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        failures
    }
}

fn collect_accepted(findings: &[SubtaskFindings]) -> Vec<Item> {
    findings
        .iter()
        .flat_map(|f| f.accepted_items.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ExecutionEventType;
    use crate::config::{CostConfig, LlmConfig};
    use crate::integrations::{
        Integration, SourceError, SourceErrorKind, SourceMetadata,
    };
    use crate::llm::testing::{ScriptStep, ScriptedClient};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    /// Integration stub that answers from a fixed response without LLM
    /// query generation.
    struct MockIntegration {
        metadata: SourceMetadata,
        response: MockResponse,
        searches: AtomicUsize,
    }

    enum MockResponse {
        Items(Vec<Item>),
        Failure(SourceErrorKind),
    }

    impl MockIntegration {
        fn with_items(id: &str, items: Vec<Item>) -> Arc<Self> {
            Arc::new(Self {
                metadata: SourceMetadata::new(id, SourceCategory::WebSearch),
                response: MockResponse::Items(items),
                searches: AtomicUsize::new(0),
            })
        }

        fn failing(id: &str, kind: SourceErrorKind) -> Arc<Self> {
            Arc::new(Self {
                metadata: SourceMetadata::new(id, SourceCategory::WebSearch),
                response: MockResponse::Failure(kind),
                searches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Integration for MockIntegration {
        fn metadata(&self) -> &SourceMetadata {
            &self.metadata
        }

        fn query_schema(&self) -> JsonSchema {
            JsonSchema::object(
                "mock_query",
                vec![
                    FieldSpec::string("query"),
                    FieldSpec::boolean("relevant"),
                ],
            )
        }

        async fn generate_query(&self, question: &Question) -> Result<Option<QueryParams>> {
            Ok(QueryParams::from_value(json!({"query": question.text})))
        }

        async fn execute_search(
            &self,
            params: &QueryParams,
            _credential: Option<&str>,
            _limit: usize,
        ) -> QueryResult {
            self.searches.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                MockResponse::Items(items) => QueryResult::ok(
                    &self.metadata.id,
                    items.clone(),
                    items.len() as u64,
                    3,
                    Some(params.clone()),
                ),
                MockResponse::Failure(kind) => QueryResult::failed(
                    &self.metadata.id,
                    SourceError::new(*kind, "scripted failure"),
                    3,
                    Some(params.clone()),
                ),
            }
        }
    }

    const TEMPLATES: &[(&str, &str)] = &[
        ("decompose", "<!--@temporal-->Decompose: {{question}}"),
        ("select_sources", "Select for {{subtask}} from {{sources_json}}"),
        ("relevance", "Score {{subtask}} via {{source_id}}: {{items_json}}"),
        (
            "reformulate",
            "Rework {{subtask}} on {{source_id}}. Was {{previous_params}} giving {{items_sample}}. Reason: {{reason}}",
        ),
        ("entities", "Entities in {{items_json}}"),
        ("entities_rich", "Rich entities in {{items_json}}"),
        (
            "followups",
            "More angles on {{question}} given {{entities_json}} and {{subtasks_json}}; up to {{remaining}}",
        ),
        (
            "synthesis",
            "<!--@temporal-->Summarize {{question}} from {{findings_json}} noting {{limitations_json}}",
        ),
    ];

    struct Harness {
        engine: DeepResearchEngine,
        client: Arc<ScriptedClient>,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    fn harness(
        steps: Vec<ScriptStep>,
        integrations: Vec<(&str, Arc<MockIntegration>)>,
    ) -> Harness {
        let prompt_dir = tempfile::tempdir().unwrap();
        for (name, body) in TEMPLATES {
            std::fs::write(prompt_dir.path().join(format!("{name}.md")), body).unwrap();
        }
        let output_dir = tempfile::tempdir().unwrap();

        let mut config = ResearchConfig::new();
        config.engine.prompt_root = prompt_dir.path().to_path_buf();
        config.engine.output_root = output_dir.path().to_path_buf();
        // Batch size 1 keeps the scripted LLM call order deterministic.
        config.execution.max_concurrent_total = 1;
        config.execution.max_concurrent_per_source = 1;
        config.execution.max_retries_per_task = 1;

        let client = Arc::new(ScriptedClient::anthropic(steps));
        let gateway = Arc::new(
            LlmGateway::new(LlmConfig::default(), &CostConfig::default())
                .with_client(client.clone()),
        );

        let mut registry = IntegrationRegistry::new();
        for (id, integration) in integrations {
            let instance = Arc::clone(&integration);
            registry.register(id, true, move || {
                Ok(Arc::clone(&instance) as Arc<dyn Integration>)
            });
        }

        let prompts = Arc::new(PromptStore::new(prompt_dir.path(), 30));
        let engine = DeepResearchEngine::with_registry(
            config,
            gateway,
            prompts,
            Arc::new(registry),
        )
        .unwrap();

        Harness {
            engine,
            client,
            _dirs: (prompt_dir, output_dir),
        }
    }

    fn reply(value: Value) -> ScriptStep {
        ScriptStep::reply(value.to_string())
    }

    #[tokio::test]
    async fn test_full_run_accepts_dedupes_and_reports() {
        let items = vec![
            Item::new("Press release", "https://evidence/a").with_description("a"),
            Item::new("Budget line", "https://evidence/b").with_description("b"),
        ];
        let mock = MockIntegration::with_items("mock-source", items);

        let h = harness(
            vec![
                reply(json!({"subtasks": [
                    {"description": "first angle"},
                    {"description": "second angle"},
                ]})),
                reply(json!({"sources": ["mock-source"]})),
                reply(json!({"score": 7, "rationale": "direct coverage"})),
                reply(json!({"sources": ["mock-source"]})),
                reply(json!({"score": 6, "rationale": "still relevant"})),
                reply(json!({"entities": [{"name": "JSOC", "entity_type": "organization"}]})),
                reply(json!({"subtasks": []})),
                reply(json!({"executive_summary": "Two corroborating documents found."})),
            ],
            vec![("mock-source", Arc::clone(&mock))],
        );

        let record = h
            .engine
            .run_research(Question::new("what did the program fund?"), None)
            .await
            .unwrap();

        assert!(record.succeeded());
        assert_eq!(record.subtasks.len(), 2);
        assert_eq!(record.subtasks[0].state, SubtaskState::Succeeded);
        // The second subtask saw only already-accepted URLs.
        assert_eq!(record.subtasks[1].state, SubtaskState::Failed);

        assert_eq!(
            record.report.citations,
            vec!["https://evidence/a", "https://evidence/b"]
        );
        assert_eq!(record.report.entity_roster.len(), 1);
        assert_eq!(record.report.entity_roster[0].name, "JSOC");
        assert_eq!(
            record.report.executive_summary,
            "Two corroborating documents found."
        );
        assert!(record.critical_source_failures.is_empty());
        assert_eq!(record.cost.call_count, 8);
        assert_eq!(h.client.call_count(), 8);

        // Event stream invariants: RUN_START first, RUN_COMPLETE last.
        let run_dir = h.engine.config.engine.output_root.join(&record.run_id);
        let events = read_event_log(&run_dir).await.unwrap();
        assert_eq!(events.first().unwrap().event_type, ExecutionEventType::RunStart);
        assert!(events.last().unwrap().is_run_complete());
        let scoring_events = events
            .iter()
            .filter(|e| e.event_type == ExecutionEventType::RelevanceScoring)
            .count();
        assert_eq!(scoring_events, 2);

        // Artifacts exist.
        assert!(run_dir.join("report.json").exists());
        assert!(run_dir.join("report.md").exists());
        assert!(run_dir.join("execution_log.jsonl").exists());

        // Completed runs replay from disk through the same surface.
        let replayed: Vec<ExecutionEvent> =
            h.engine.stream_progress(&record.run_id).collect().await;
        assert_eq!(replayed.len(), events.len());
    }

    #[tokio::test]
    async fn test_empty_question_degrades_to_wrapped_subtask() {
        let mock = MockIntegration::with_items("mock-source", vec![]);
        let h = harness(
            vec![
                reply(json!({"sources": ["mock-source"]})),
                reply(json!({"subtasks": []})),
            ],
            vec![("mock-source", mock)],
        );

        let record = h
            .engine
            .run_research(Question::new(""), None)
            .await
            .unwrap();

        assert!(!record.succeeded());
        assert_eq!(record.subtasks.len(), 1);
        assert_eq!(record.subtasks[0].description, "(empty)");
        assert!(record
            .report
            .limitations
            .iter()
            .any(|l| l.kind == "degenerate_input"));
        assert!(record
            .report
            .limitations
            .iter()
            .any(|l| l.kind == "no_results"));
        // No synthesis call was spent on an empty run.
        assert_eq!(h.client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_source_becomes_critical_failure() {
        let flaky = MockIntegration::failing("flaky", SourceErrorKind::RateLimited);
        let h = harness(
            vec![
                reply(json!({"subtasks": []})),
                reply(json!({"sources": ["flaky"]})),
                reply(json!({"subtasks": []})),
            ],
            vec![("flaky", flaky)],
        );

        let record = h
            .engine
            .run_research(Question::new("rate limit probe"), None)
            .await
            .unwrap();

        assert!(!record.succeeded());
        assert_eq!(record.critical_source_failures.len(), 1);
        let failure = &record.critical_source_failures[0];
        assert_eq!(failure.source_id, "flaky");
        assert_eq!(failure.error_kinds, vec![SourceErrorKind::RateLimited]);

        // The limitations section names the source and the error kind.
        let limitation = record
            .report
            .limitations
            .iter()
            .find(|l| l.source_id.as_deref() == Some("flaky"))
            .unwrap();
        assert_eq!(limitation.kind, "rate_limited");

        let run_dir = h.engine.config.engine.output_root.join(&record.run_id);
        let events = read_event_log(&run_dir).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == ExecutionEventType::CriticalSourceFailure));
    }

    #[tokio::test]
    async fn test_reformulation_retries_then_accepts() {
        let items = vec![Item::new("Weak hit", "https://evidence/w")];
        let mock = MockIntegration::with_items("mock-source", items);

        let h = harness(
            vec![
                reply(json!({"subtasks": []})),
                reply(json!({"sources": ["mock-source"]})),
                reply(json!({"score": 0, "rationale": "off topic"})),
                reply(json!({"query": "narrower terms"})),
                reply(json!({"score": 5, "rationale": "better focus"})),
                reply(json!({"entities": []})),
                reply(json!({"subtasks": []})),
                reply(json!({"executive_summary": "One weak but relevant hit."})),
            ],
            vec![("mock-source", Arc::clone(&mock))],
        );

        let record = h
            .engine
            .run_research(Question::new("needle in the archives"), None)
            .await
            .unwrap();

        assert!(record.succeeded());
        assert_eq!(record.subtasks[0].retry_count, 1);
        assert_eq!(mock.searches.load(Ordering::SeqCst), 2);

        let run_dir = h.engine.config.engine.output_root.join(&record.run_id);
        let events = read_event_log(&run_dir).await.unwrap();
        let decisions: Vec<String> = events
            .iter()
            .filter(|e| e.event_type == ExecutionEventType::FilterDecision)
            .map(|e| e.payload["decision"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(decisions, vec!["reformulate", "accept"]);

        // Both dispatch attempts were logged and archived.
        let api_calls = events
            .iter()
            .filter(|e| e.event_type == ExecutionEventType::ApiCall)
            .count();
        assert_eq!(api_calls, 2);
        assert!(run_dir.join("raw").join("t1_mock-source_a0.json").exists());
        assert!(run_dir.join("raw").join("t1_mock-source_a1.json").exists());
    }

    #[tokio::test]
    async fn test_retry_count_never_exceeds_budget() {
        // Scores stay below threshold; with max_retries_per_task = 1 the
        // loop must reformulate once and then reject.
        let items = vec![Item::new("Noise", "https://noise/1")];
        let mock = MockIntegration::with_items("mock-source", items);

        let h = harness(
            vec![
                reply(json!({"subtasks": []})),
                reply(json!({"sources": ["mock-source"]})),
                reply(json!({"score": 0, "rationale": "noise"})),
                reply(json!({"query": "still noise"})),
                reply(json!({"score": 0, "rationale": "noise again"})),
                reply(json!({"subtasks": []})),
            ],
            vec![("mock-source", Arc::clone(&mock))],
        );

        let record = h
            .engine
            .run_research(Question::new("unanswerable"), None)
            .await
            .unwrap();

        assert!(!record.succeeded());
        assert_eq!(record.subtasks[0].retry_count, 1);
        assert!(record.subtasks[0].retry_count <= 1);
        assert_eq!(mock.searches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_caller_sensitivity_overrides_classifier() {
        // A mundane question tagged sensitive gets the low threshold, so a
        // score of 2 is accepted.
        let items = vec![Item::new("Indirect evidence", "https://evidence/i")];
        let mock = MockIntegration::with_items("mock-source", items);

        let h = harness(
            vec![
                reply(json!({"subtasks": []})),
                reply(json!({"sources": ["mock-source"]})),
                reply(json!({"score": 2, "rationale": "indirect"})),
                reply(json!({"entities": []})),
                reply(json!({"subtasks": []})),
                reply(json!({"executive_summary": "Indirect evidence only."})),
            ],
            vec![("mock-source", mock)],
        );

        let record = h
            .engine
            .run_research(
                Question::new("grant awards overview").with_sensitivity(Sensitivity::Sensitive),
                None,
            )
            .await
            .unwrap();

        assert!(record.succeeded());
        assert_eq!(record.report.findings[0].accepted_items.len(), 1);
    }

    #[tokio::test]
    async fn test_config_overrides_apply_per_run() {
        let mock = MockIntegration::with_items("mock-source", vec![]);
        let h = harness(
            vec![
                reply(json!({"subtasks": []})),
                reply(json!({"sources": ["mock-source"]})),
                reply(json!({"subtasks": []})),
            ],
            vec![("mock-source", mock)],
        );

        let record = h
            .engine
            .run_research(
                Question::new("override check"),
                Some(json!({"execution": {"max_tasks": 1}})),
            )
            .await
            .unwrap();
        assert_eq!(
            record.config_snapshot["execution"]["max_tasks"],
            json!(1)
        );
    }
}
