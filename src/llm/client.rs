//! LLM client trait and provider implementations.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

use super::types::{
    ChatRole, CompletionRequest, CompletionResponse, ModelSpec, Provider, StopReason, TokenUsage,
};

/// LLM client trait for making completions against one provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete a prompt. Transport-level problems surface as
    /// [`Error::LlmTransport`]; response text is returned verbatim.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Get the provider for this client.
    fn provider(&self) -> Provider;
}

/// Configuration for LLM clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API key
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
    /// Default model
    pub default_model: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            default_model: None,
            timeout_secs: 120,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))
}

/// Appended to the system prompt when native strict-JSON output is not
/// available on the wire.
const JSON_SYSTEM_SUFFIX: &str =
    "Respond with a single valid JSON object and nothing else. No prose, no code fences.";

/// Anthropic Claude client.
pub struct AnthropicClient {
    config: ClientConfig,
    http: Client,
}

impl AnthropicClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = build_http_client(config.timeout_secs)?;
        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    model: String,
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request
            .model
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| ModelSpec::claude_sonnet().id);
        let spec = ModelSpec::for_model_id(&model);

        let mut system = request.system;
        if request.strict_json {
            // No tool-use JSON mode on this wire path: enforce via the
            // system prompt and validate downstream at the gateway.
            system = Some(match system {
                Some(existing) => format!("{existing}\n\n{JSON_SYSTEM_SUFFIX}"),
                None => JSON_SYSTEM_SUFFIX.to_string(),
            });
        }

        let messages: Vec<AnthropicMessage> = request
            .messages
            .iter()
            .map(|m| AnthropicMessage {
                role: match m.role {
                    ChatRole::Assistant => "assistant".to_string(),
                    // System content is carried in the dedicated field.
                    ChatRole::User | ChatRole::System => "user".to_string(),
                },
                content: m.content.clone(),
            })
            .collect();

        let api_request = AnthropicRequest {
            model: model.clone(),
            messages,
            // The wire format requires a cap; send the model ceiling so
            // output is never silently truncated below it.
            max_tokens: spec.max_output,
            system,
            temperature: request.temperature,
        };

        let url = format!("{}/v1/messages", self.base_url());
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::llm_transport("anthropic", format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::llm_transport("anthropic", format!("failed to read body: {e}")))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<AnthropicError>(&body) {
                return Err(Error::llm_transport(
                    "anthropic",
                    format!("{} ({})", error.error.message, error.error.error_type),
                ));
            }
            return Err(Error::llm_transport("anthropic", format!("{status}: {body}")));
        }

        let api_response: AnthropicResponse = serde_json::from_str(&body)
            .map_err(|e| Error::llm_transport("anthropic", format!("unparseable response: {e}")))?;

        let content = api_response
            .content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        let stop_reason = api_response.stop_reason.as_deref().map(|r| match r {
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            _ => StopReason::EndTurn,
        });

        let usage = TokenUsage::new(
            api_response.usage.input_tokens,
            api_response.usage.output_tokens,
        );
        let cost = spec.calculate_cost(usage.input_tokens, usage.output_tokens);

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content,
            stop_reason,
            usage,
            cost,
        })
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }
}

/// OpenAI client.
pub struct OpenAiClient {
    config: ClientConfig,
    http: Client,
}

impl OpenAiClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = build_http_client(config.timeout_secs)?;
        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OpenAiResponseFormat>,
}

#[derive(Debug, Serialize)]
struct OpenAiResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    id: String,
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: OpenAiUsage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    error: OpenAiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorDetail {
    message: String,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request
            .model
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| ModelSpec::gpt4o().id);
        let spec = ModelSpec::for_model_id(&model);

        let mut messages: Vec<OpenAiMessage> = Vec::new();
        if let Some(system) = &request.system {
            messages.push(OpenAiMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        for m in &request.messages {
            messages.push(OpenAiMessage {
                role: match m.role {
                    ChatRole::User => "user".to_string(),
                    ChatRole::Assistant => "assistant".to_string(),
                    ChatRole::System => "system".to_string(),
                },
                content: m.content.clone(),
            });
        }

        // json_object mode requires the word "json" somewhere in the input.
        let response_format = request.strict_json.then(|| {
            if let Some(last) = messages.last_mut() {
                if !last.content.to_lowercase().contains("json") {
                    last.content.push_str("\n\nRespond in JSON.");
                }
            }
            OpenAiResponseFormat {
                format_type: "json_object",
            }
        });

        let api_request = OpenAiRequest {
            model: model.clone(),
            messages,
            temperature: request.temperature,
            response_format,
        };

        let url = format!("{}/v1/chat/completions", self.base_url());
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::llm_transport("openai", format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::llm_transport("openai", format!("failed to read body: {e}")))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<OpenAiError>(&body) {
                return Err(Error::llm_transport("openai", error.error.message));
            }
            return Err(Error::llm_transport("openai", format!("{status}: {body}")));
        }

        let api_response: OpenAiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::llm_transport("openai", format!("unparseable response: {e}")))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::llm_transport("openai", "no choices in response"))?;

        let stop_reason = choice.finish_reason.as_deref().map(|r| match r {
            "length" => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        });

        let usage = TokenUsage::new(
            api_response.usage.prompt_tokens,
            api_response.usage.completion_tokens,
        );
        let cost = spec.calculate_cost(usage.input_tokens, usage.output_tokens);

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content: choice.message.content,
            stop_reason,
            usage,
            cost,
        })
    }

    fn provider(&self) -> Provider {
        Provider::OpenAi
    }
}

/// Build a client for whichever provider a model id belongs to, keyed off
/// the conventional environment variables.
pub fn client_for_model(model_id: &str, timeout_secs: u64) -> Result<Box<dyn LlmClient>> {
    let spec = ModelSpec::for_model_id(model_id);
    match spec.provider {
        Provider::Anthropic => {
            let key = std::env::var("ANTHROPIC_API_KEY")
                .map_err(|_| Error::config("ANTHROPIC_API_KEY is not set"))?;
            Ok(Box::new(AnthropicClient::new(
                ClientConfig::new(key).with_timeout(timeout_secs),
            )?))
        }
        Provider::OpenAi => {
            let key = std::env::var("OPENAI_API_KEY")
                .map_err(|_| Error::config("OPENAI_API_KEY is not set"))?;
            Ok(Box::new(OpenAiClient::new(
                ClientConfig::new(key).with_timeout(timeout_secs),
            )?))
        }
    }
}
