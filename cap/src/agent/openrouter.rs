//! OpenRouter-compatible chat completions client
//!
//! Speaks the OpenAI wire format against a configurable base URL, which
//! covers OpenRouter and any compatible gateway. Also provides the deferred
//! cost lookup against the provider's generation endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};
use unilog::{CostData, CostLookup};

use super::client::Agent;
use super::error::AgentError;
use super::types::{AgentRequest, AgentResponse, NativeFunction, NativeToolCall};
use crate::config::ProviderConfig;

/// Check if an HTTP status code is retryable
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// OpenRouter-style chat completions client
pub struct OpenRouterAgent {
    api_key: String,
    base_url: String,
    http: Client,
    max_tokens: u32,
    timeout: Duration,
}

impl OpenRouterAgent {
    /// Create a client from provider configuration
    pub fn from_config(config: &ProviderConfig) -> Result<Self, AgentError> {
        let api_key = config.api_key().unwrap_or_default();
        let timeout = Duration::from_millis(config.timeout_ms);
        let http = Client::builder().timeout(timeout).build().map_err(AgentError::Network)?;

        Ok(Self {
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
            max_tokens: config.max_tokens,
            timeout,
        })
    }

    fn build_request_body(&self, request: &AgentRequest) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": request.system,
        })];
        for msg in &request.context {
            messages.push(serde_json::json!({
                "role": msg.role.as_str(),
                "content": msg.content,
            }));
        }
        if let Some(user) = &request.user {
            messages.push(serde_json::json!({
                "role": "user",
                "content": user,
            }));
        }

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "usage": { "include": true },
        });

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(request.tools);
            body["tool_choice"] = serde_json::json!("auto");
        }

        body
    }
}

#[async_trait]
impl Agent for OpenRouterAgent {
    async fn run(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        let body = self.build_request_body(&request);
        let url = format!("{}/chat/completions", self.base_url);
        let started = Instant::now();

        debug!(model = %request.model, "Sending chat completion request");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::Timeout(self.timeout)
                } else {
                    AgentError::Network(e)
                }
            })?;

        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(60));
            warn!(?retry_after, "Rate limited by provider");
            return Err(AgentError::RateLimited { retry_after });
        }
        if status >= 400 {
            let message = response.text().await.unwrap_or_default();
            if is_retryable_status(status) {
                warn!(status, "Retryable API error");
            }
            return Err(AgentError::Api { status, message });
        }

        let full_response: serde_json::Value = response.json().await.map_err(AgentError::Network)?;
        let parsed: ChatCompletionResponse = serde_json::from_value(full_response.clone())?;
        let duration_ms = started.elapsed().as_millis() as f64;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(AgentError::EmptyResponse)?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| NativeToolCall {
                id: tc.id,
                function: NativeFunction {
                    name: tc.function.name,
                    arguments: tc.function.arguments,
                },
            })
            .collect::<Vec<_>>();

        let content = choice.message.content.unwrap_or_default();
        if content.is_empty() && tool_calls.is_empty() {
            return Err(AgentError::EmptyResponse);
        }

        Ok(AgentResponse {
            content,
            tool_calls,
            request_id: parsed.id,
            model: parsed.model.unwrap_or(request.model),
            provider: parsed.provider,
            tokens_in: parsed.usage.as_ref().map(|u| u.prompt_tokens),
            tokens_out: parsed.usage.as_ref().map(|u| u.completion_tokens),
            cost: parsed.usage.as_ref().and_then(|u| u.cost),
            duration_ms: Some(duration_ms),
            full_request: Some(body),
            full_response: Some(full_response),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    id: Option<String>,
    model: Option<String>,
    provider: Option<String>,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: i64,
    completion_tokens: i64,
    cost: Option<f64>,
}

/// Cost lookup against the provider's generation endpoint
///
/// Routed providers publish real cost and native token counts a few seconds
/// after a generation completes; the unified log's background worker drives
/// the retry schedule, this type does a single fetch.
pub struct GenerationCostLookup {
    api_key: String,
    base_url: String,
    http: Client,
}

impl GenerationCostLookup {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, AgentError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(AgentError::Network)?;
        Ok(Self {
            api_key: config.api_key().unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl CostLookup for GenerationCostLookup {
    async fn lookup(&self, request_id: &str) -> Option<CostData> {
        let url = format!("{}/generation?id={}", self.base_url, request_id);
        let response = self.http.get(&url).bearer_auth(&self.api_key).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }

        let body: serde_json::Value = response.json().await.ok()?;
        let data = body.get("data")?;

        let cost = data
            .get("total_cost")
            .and_then(|v| v.as_f64())
            .or_else(|| data.get("cost").and_then(|v| v.as_f64()))?;
        let tokens_in = data
            .get("native_tokens_prompt")
            .and_then(|v| v.as_i64())
            .or_else(|| data.get("tokens_prompt").and_then(|v| v.as_i64()))
            .unwrap_or(0);
        let tokens_out = data
            .get("native_tokens_completion")
            .and_then(|v| v.as_i64())
            .or_else(|| data.get("tokens_completion").and_then(|v| v.as_i64()))
            .unwrap_or(0);
        let provider = data.get("provider").and_then(|v| v.as_str()).map(String::from);

        Some(CostData {
            cost: Some(cost),
            tokens_in,
            tokens_out,
            provider,
        })
    }
}
