//! LLM gateway: the single call-site for generative completions.
//!
//! Responsibilities per the engine contract:
//! - deterministic response caching keyed by a SHA-256 of the canonical
//!   request JSON (a hit charges zero tokens),
//! - budget enforcement *before* any provider request is made,
//! - post-call cost reconciliation against real token usage,
//! - propagating provider errors unchanged so the supervisor can retry.

mod cache;
mod provider;

pub use cache::{CacheEntry, DEFAULT_TTL_DAYS, ResponseCache};
pub use provider::{CompletionProvider, HttpProvider, ProviderResponse, ScriptedProvider};

use crate::errors::GatewayError;
use crate::supervisor::budget::CostTracker;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A completion request. The cache key covers every field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Gateway result handed to stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub model: String,
    pub provider: String,
    /// True when served from the cache; cached calls charge zero tokens.
    pub cached: bool,
}

/// One accounted call, reported to the supervisor for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallRecord {
    pub model: String,
    pub provider: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub cost: f64,
    pub stage: String,
    pub purpose: String,
    pub cached: bool,
}

/// Receives per-call usage records. Implemented by the supervisor.
pub trait UsageSink: Send + Sync {
    fn track_llm_call(&self, record: &LlmCallRecord);
}

/// Rough pre-call token estimate: character count divided by four.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 / 4).max(1)
}

/// SHA-256 over the canonical JSON of the request. Byte-identical requests
/// hash identically, which is the whole cache-determinism contract.
pub fn prompt_hash(request: &CompletionRequest) -> String {
    let canonical = serde_json::to_string(request).expect("request serialization cannot fail");
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{digest:x}")
}

/// The gateway.
pub struct LlmGateway {
    provider: Box<dyn CompletionProvider>,
    cache: ResponseCache,
    tracker: Arc<CostTracker>,
    sink: Option<Arc<dyn UsageSink>>,
}

impl LlmGateway {
    pub fn new(
        provider: Box<dyn CompletionProvider>,
        cache: ResponseCache,
        tracker: Arc<CostTracker>,
    ) -> Self {
        Self {
            provider,
            cache,
            tracker,
            sink: None,
        }
    }

    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Complete a request. Cache hit short-circuits the provider entirely;
    /// a miss is budget-checked, executed, reconciled, and cached.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        stage: &str,
        purpose: &str,
    ) -> Result<Completion, GatewayError> {
        let key = prompt_hash(request);

        if let Some(entry) = self.cache.get(&key) {
            tracing::debug!(stage, purpose, key = %key, "llm cache hit");
            let completion = Completion {
                content: entry.content,
                tokens_input: 0,
                tokens_output: 0,
                model: request.model.clone(),
                provider: self.provider.name().to_string(),
                cached: true,
            };
            self.report(&completion, stage, purpose, 0.0);
            return Ok(completion);
        }

        // Pre-call projection: input from character counts, output from the
        // request ceiling. Must fit the budget before the provider is touched.
        let projected_input: u64 = request
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum();
        let projected_cost = self.tracker.cost_of(
            projected_input,
            request.max_tokens as u64,
            &request.model,
        );
        self.tracker
            .try_reserve(projected_cost)
            .map_err(|e| GatewayError::BudgetExceeded {
                window: e.window,
                projected: e.projected,
                limit: e.limit,
            })?;

        let response = self.provider.complete(request).await?;

        let actual_cost = self.tracker.cost_of(
            response.tokens_input,
            response.tokens_output,
            &request.model,
        );
        if let Err(e) = self.tracker.record(actual_cost) {
            // The call already happened; surface the reconciliation gap
            // rather than double-failing the stage.
            tracing::warn!(stage, error = %e, "post-call cost reconciliation exceeded window");
        }

        self.cache
            .put(&key, &response.content, &request.model)
            .map_err(GatewayError::Other)?;

        let completion = Completion {
            content: response.content,
            tokens_input: response.tokens_input,
            tokens_output: response.tokens_output,
            model: request.model.clone(),
            provider: self.provider.name().to_string(),
            cached: false,
        };
        self.report(&completion, stage, purpose, actual_cost);
        Ok(completion)
    }

    fn report(&self, completion: &Completion, stage: &str, purpose: &str, cost: f64) {
        if let Some(sink) = &self.sink {
            sink.track_llm_call(&LlmCallRecord {
                model: completion.model.clone(),
                provider: completion.provider.clone(),
                tokens_input: completion.tokens_input,
                tokens_output: completion.tokens_output,
                cost,
                stage: stage.to_string(),
                purpose: purpose.to_string(),
                cached: completion.cached,
            });
        }
    }
}
