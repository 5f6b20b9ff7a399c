//! Per-stage recovery strategies.

use crate::stage::StageName;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canned result applied when retries are exhausted and the stage has a
/// configured fallback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackAction {
    pub label: String,
    pub result: Value,
}

/// How the supervisor treats one stage's failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryStrategy {
    pub max_retries: u32,
    pub retry_delay_seconds: f64,
    pub backoff_multiplier: f64,
    pub timeout_seconds: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_action: Option<FallbackAction>,
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_seconds: 2.0,
            backoff_multiplier: 2.0,
            timeout_seconds: 120,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_seconds: 60,
            fallback_action: None,
        }
    }
}

impl RecoveryStrategy {
    /// Defaults for a stage, with the stage's standard timeout.
    pub fn for_stage(stage: StageName) -> Self {
        Self {
            timeout_seconds: stage.default_timeout_secs(),
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_breaker(mut self, threshold: u32, timeout_seconds: u64) -> Self {
        self.circuit_breaker_threshold = threshold;
        self.circuit_breaker_timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_fallback(mut self, label: &str, result: Value) -> Self {
        self.fallback_action = Some(FallbackAction {
            label: label.to_string(),
            result,
        });
        self
    }

    /// Wait before retry number `retry_count` (0-based):
    /// `retry_delay_seconds × backoff_multiplier^retry_count`.
    pub fn backoff_delay_seconds(&self, retry_count: u32) -> f64 {
        self.retry_delay_seconds * self.backoff_multiplier.powi(retry_count as i32)
    }
}
