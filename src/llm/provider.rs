//! Completion providers behind the gateway.
//!
//! Two implementations ship: an HTTP provider speaking the common
//! chat-completions wire shape, and a scripted provider that answers
//! deterministically from configured rules, used by tests and offline runs.

use super::{ChatRole, CompletionRequest, estimate_tokens};
use crate::errors::GatewayError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

/// What a provider returns before gateway accounting is applied.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
}

/// A completion backend. Errors propagate unchanged so the supervisor's
/// retry policy can react to them.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<ProviderResponse, GatewayError>;
}

// ── HTTP provider ───────────────────────────────────────────────────

/// Chat-completions HTTP provider.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpProvider {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl CompletionProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<ProviderResponse, GatewayError> {
        let body = json!({
            "model": request.model,
            "messages": request
                .messages
                .iter()
                .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
                .collect::<Vec<_>>(),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Provider(format!("request failed: {e}")))?;

        if response.status().as_u16() == 429 {
            let retry_after_seconds = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(30);
            return Err(GatewayError::RateLimited {
                retry_after_seconds,
            });
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Provider(format!(
                "provider returned {status}: {text}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;

        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| GatewayError::MalformedResponse("empty choices".to_string()))?;

        let (tokens_input, tokens_output) = match parsed.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (
                request
                    .messages
                    .iter()
                    .map(|m| estimate_tokens(&m.content))
                    .sum(),
                estimate_tokens(&content),
            ),
        };

        Ok(ProviderResponse {
            content,
            tokens_input,
            tokens_output,
        })
    }
}

// ── Scripted provider ───────────────────────────────────────────────

/// Deterministic provider answering from substring rules against the last
/// user message. Unmatched prompts receive the default response.
pub struct ScriptedProvider {
    rules: Vec<(String, String)>,
    default_response: String,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_response: "{}".to_string(),
        }
    }

    pub fn with_rule(mut self, pattern: &str, response: &str) -> Self {
        self.rules.push((pattern.to_string(), response.to_string()));
        self
    }

    pub fn with_default(mut self, response: &str) -> Self {
        self.default_response = response.to_string();
        self
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<ProviderResponse, GatewayError> {
        let prompt: String = request
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let content = self
            .rules
            .iter()
            .find(|(pattern, _)| prompt.contains(pattern.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| self.default_response.clone());

        Ok(ProviderResponse {
            tokens_input: request
                .messages
                .iter()
                .map(|m| estimate_tokens(&m.content))
                .sum(),
            tokens_output: estimate_tokens(&content),
            content,
        })
    }
}
