//! Scripted LLM client for unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};

use super::client::LlmClient;
use super::types::{CompletionRequest, CompletionResponse, Provider, StopReason, TokenUsage};

/// One scripted outcome for a call.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply(String),
    TransportError(String),
}

impl ScriptStep {
    pub fn reply(content: impl Into<String>) -> Self {
        Self::Reply(content.into())
    }

    pub fn transport_error(message: impl Into<String>) -> Self {
        Self::TransportError(message.into())
    }
}

/// An [`LlmClient`] that replays a fixed script and records prompts.
pub struct ScriptedClient {
    provider: Provider,
    steps: Mutex<VecDeque<ScriptStep>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    cost_per_call: f64,
}

impl ScriptedClient {
    pub fn anthropic(steps: Vec<ScriptStep>) -> Self {
        Self::new(Provider::Anthropic, steps)
    }

    pub fn new(provider: Provider, steps: Vec<ScriptStep>) -> Self {
        Self {
            provider,
            steps: Mutex::new(steps.into()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            cost_per_call: 0.0001,
        }
    }

    pub fn with_cost_per_call(mut self, cost: f64) -> Self {
        self.cost_per_call = cost;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// All user-message prompts seen so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let prompt = request
            .messages
            .iter()
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts.lock().unwrap().push(prompt);

        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptStep::transport_error("script exhausted"));

        match step {
            ScriptStep::Reply(content) => Ok(CompletionResponse {
                id: format!("scripted-{}", self.call_count()),
                model: request.model.unwrap_or_else(|| "scripted".to_string()),
                content,
                stop_reason: Some(StopReason::EndTurn),
                usage: TokenUsage::new(100, 50),
                cost: self.cost_per_call,
            }),
            ScriptStep::TransportError(message) => {
                Err(Error::llm_transport(self.provider.to_string(), message))
            }
        }
    }

    fn provider(&self) -> Provider {
        self.provider
    }
}
