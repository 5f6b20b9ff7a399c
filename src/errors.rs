//! Typed error hierarchy for the Artemis pipeline engine.
//!
//! Each subsystem gets its own `thiserror` enum:
//! - `GatewayError`: LLM gateway and provider failures
//! - `CheckpointError`: checkpoint persistence and state-machine violations
//! - `BusError`: messaging bus persistence failures
//! - `SandboxError`: sandbox spawn/setup failures
//!
//! Stage executions never surface raw errors to the orchestrator. They return
//! a [`StageFailure`] carrying a [`FailureKind`] classification, which is what
//! the supervisor matches on to pick a recovery policy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Policy classification carried on every stage failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network/provider timeouts and rate limits. Retried per the stage's
    /// recovery strategy.
    TransientExternal,
    /// Cost guard triggered. Fails immediately; never retried and never
    /// counted against the circuit breaker.
    BudgetExceeded,
    /// Generated code failed the security scan or a resource limit.
    /// Disqualifies a candidate rather than the whole stage.
    SandboxViolation,
    /// A stage produced malformed output: missing context keys, unparseable
    /// JSON from the LLM. Retried up to `max_retries`, fatal thereafter.
    ContractViolation,
    /// The supervisor skipped the stage because its circuit was open. Only
    /// the orchestrator produces this kind; stages never do.
    CircuitOpen,
    /// Invariant violations and checkpoint I/O errors. Aborts the run.
    Fatal,
}

impl FailureKind {
    /// Whether the supervisor may re-attempt a failure of this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientExternal | Self::ContractViolation)
    }

    /// Whether a failure of this kind increments the circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        !matches!(self, Self::BudgetExceeded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientExternal => "transient_external",
            Self::BudgetExceeded => "budget_exceeded",
            Self::SandboxViolation => "sandbox_violation",
            Self::ContractViolation => "contract_violation",
            Self::CircuitOpen => "circuit_open",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stage execution failure with its policy classification.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Provider-supplied wait hint, present on rate-limit failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransientExternal, message)
    }

    pub fn budget(message: impl Into<String>) -> Self {
        Self::new(FailureKind::BudgetExceeded, message)
    }

    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::new(FailureKind::SandboxViolation, message)
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ContractViolation, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, message)
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }
}

impl From<GatewayError> for StageFailure {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::RateLimited {
                retry_after_seconds,
            } => Self::transient(format!(
                "provider rate limited, retry after {retry_after_seconds}s"
            ))
            .with_retry_after(retry_after_seconds),
            GatewayError::BudgetExceeded { .. } => Self::budget(err.to_string()),
            GatewayError::MalformedResponse(msg) => Self::contract(msg),
            GatewayError::Provider(msg) => Self::transient(msg),
            GatewayError::Other(e) => Self::transient(e.to_string()),
        }
    }
}

/// Errors from the LLM gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Provider request failed: {0}")]
    Provider(String),

    #[error("Provider rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error(
        "Completion would exceed the {window} budget: projected ${projected:.4} against ${limit:.2} limit"
    )]
    BudgetExceeded {
        window: String,
        projected: f64,
        limit: f64,
    },

    #[error("Provider returned a malformed response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the checkpoint manager.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No checkpoint found for card {card_id}")]
    NotFound { card_id: String },

    #[error("Checkpoint for card {card_id} is terminal ({status}) and rejects mutation")]
    Terminal { card_id: String, status: String },

    #[error("Failed to write checkpoint at {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the messaging bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Agent {0} is not registered on the bus")]
    UnknownAgent(String),

    #[error("Failed to persist message {message_id}: {source}")]
    PersistFailed {
        message_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the sandbox executor.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Unsupported sandbox language: {0}")]
    UnsupportedLanguage(String),

    #[error("Failed to spawn sandbox process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(FailureKind::TransientExternal.is_retryable());
        assert!(FailureKind::ContractViolation.is_retryable());
        assert!(!FailureKind::BudgetExceeded.is_retryable());
        assert!(!FailureKind::SandboxViolation.is_retryable());
        assert!(!FailureKind::CircuitOpen.is_retryable());
        assert!(!FailureKind::Fatal.is_retryable());
    }

    #[test]
    fn budget_exceeded_does_not_trip_breaker() {
        assert!(!FailureKind::BudgetExceeded.trips_breaker());
        assert!(FailureKind::TransientExternal.trips_breaker());
        assert!(FailureKind::Fatal.trips_breaker());
    }

    #[test]
    fn rate_limit_converts_with_hint() {
        let failure: StageFailure = GatewayError::RateLimited {
            retry_after_seconds: 30,
        }
        .into();
        assert_eq!(failure.kind, FailureKind::TransientExternal);
        assert_eq!(failure.retry_after_seconds, Some(30));
    }

    #[test]
    fn budget_gateway_error_converts_to_budget_failure() {
        let failure: StageFailure = GatewayError::BudgetExceeded {
            window: "daily".to_string(),
            projected: 0.069,
            limit: 0.05,
        }
        .into();
        assert_eq!(failure.kind, FailureKind::BudgetExceeded);
        assert!(failure.message.contains("daily"));
    }

    #[test]
    fn checkpoint_terminal_error_is_matchable() {
        let err = CheckpointError::Terminal {
            card_id: "c-9".to_string(),
            status: "completed".to_string(),
        };
        match &err {
            CheckpointError::Terminal { card_id, status } => {
                assert_eq!(card_id, "c-9");
                assert_eq!(status, "completed");
            }
            _ => panic!("Expected Terminal variant"),
        }
    }

    #[test]
    fn stage_failure_round_trips_through_json() {
        let failure = StageFailure::contract("missing key 'adr_file'");
        let json = serde_json::to_string(&failure).unwrap();
        let parsed: StageFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, FailureKind::ContractViolation);
        assert_eq!(parsed.message, "missing key 'adr_file'");
    }
}
