//! Supervisor: retries, timeouts, circuit breakers, health, budget, and the
//! process reaper: the recovery layer wrapped around every stage execution.

pub mod budget;
mod health;
mod recovery;
mod reaper;
mod unexpected;

pub use budget::{BudgetConfig, BudgetSnapshot, CostTracker, ModelRate};
pub use health::{HealthRegistry, HealthStatus, StageHealth};
pub use recovery::{FallbackAction, RecoveryStrategy};
pub use reaper::{MonitoredProcess, ProcessReaper};
pub use unexpected::{Resolution, UnexpectedState, UnexpectedStateHandler};

use crate::card::Card;
use crate::context::Context;
use crate::errors::{FailureKind, StageFailure};
use crate::llm::{LlmCallRecord, LlmGateway, UsageSink};
use crate::rag::ArtifactStore;
use crate::sandbox::{ExecutionResult, Language, SandboxExecutor};
use crate::stage::{Stage, StageName, StageOutput, StageServices, run_stage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Aggregated gateway usage, by stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmUsageStats {
    pub calls: u64,
    pub cached_calls: u64,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub calls_by_stage: BTreeMap<String, u64>,
}

/// Snapshot returned by [`Supervisor::statistics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStatistics {
    pub status: HealthStatus,
    pub stages: BTreeMap<String, StageHealth>,
    pub llm: LlmUsageStats,
    pub budget: BudgetSnapshot,
}

/// Outcome of one supervised stage execution.
#[derive(Debug)]
pub enum SupervisedOutcome {
    /// The stage produced a result, possibly after retries, possibly via a
    /// configured fallback.
    Completed {
        output: StageOutput,
        retries: u32,
        fallback_applied: Option<String>,
    },
    /// The circuit was open; the stage never ran. Carries the fallback
    /// result when one is configured.
    Skipped {
        reason: String,
        fallback: Option<StageOutput>,
    },
    /// Unrecoverable after policy was applied.
    Failed { failure: StageFailure, retries: u32 },
}

pub struct Supervisor {
    strategies: Mutex<BTreeMap<String, RecoveryStrategy>>,
    health: HealthRegistry,
    tracker: Arc<CostTracker>,
    llm_stats: Mutex<LlmUsageStats>,
    reaper: Arc<ProcessReaper>,
    sandbox: Arc<SandboxExecutor>,
    unexpected: UnexpectedStateHandler,
}

impl Supervisor {
    pub fn new(
        tracker: Arc<CostTracker>,
        sandbox: Arc<SandboxExecutor>,
        artifacts: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            strategies: Mutex::new(BTreeMap::new()),
            health: HealthRegistry::new(),
            tracker,
            llm_stats: Mutex::new(LlmUsageStats::default()),
            reaper: Arc::new(ProcessReaper::new()),
            sandbox: sandbox.clone(),
            unexpected: UnexpectedStateHandler::new(artifacts, sandbox),
        }
    }

    pub fn tracker(&self) -> Arc<CostTracker> {
        self.tracker.clone()
    }

    pub fn reaper(&self) -> Arc<ProcessReaper> {
        self.reaper.clone()
    }

    /// Register (or replace) a stage's recovery strategy.
    pub fn register_stage(&self, stage: StageName, strategy: RecoveryStrategy) {
        self.strategies
            .lock()
            .expect("strategy lock poisoned")
            .insert(stage.as_str().to_string(), strategy);
    }

    pub fn strategy_for(&self, stage: StageName) -> RecoveryStrategy {
        self.strategies
            .lock()
            .expect("strategy lock poisoned")
            .get(stage.as_str())
            .cloned()
            .unwrap_or_else(|| RecoveryStrategy::for_stage(stage))
    }

    /// Run a stage under full supervision: circuit check, per-attempt
    /// timeout, retry with exponential backoff, fallback on exhaustion.
    pub async fn execute_with_supervision(
        &self,
        stage: &dyn Stage,
        card: &Card,
        ctx: &Context,
        services: &StageServices,
        token: &CancellationToken,
    ) -> SupervisedOutcome {
        let name = stage.name();
        let strategy = self.strategy_for(name);

        if self.health.is_circuit_open(name.as_str()) {
            tracing::warn!(stage = name.as_str(), "circuit open, skipping stage");
            return SupervisedOutcome::Skipped {
                reason: "circuit_breaker_open".to_string(),
                fallback: strategy
                    .fallback_action
                    .as_ref()
                    .map(|fb| StageOutput::new(fb.result.clone())),
            };
        }

        let mut retries = 0u32;
        loop {
            let attempt_token = token.child_token();
            let started = Instant::now();

            let attempt = tokio::time::timeout(
                Duration::from_secs(strategy.timeout_seconds),
                run_stage(stage, card, ctx, services, &attempt_token),
            )
            .await;

            let duration = started.elapsed().as_secs_f64();
            let result = match attempt {
                Ok(result) => result,
                Err(_elapsed) => {
                    attempt_token.cancel();
                    Err(StageFailure::transient(format!(
                        "stage timed out after {}s",
                        strategy.timeout_seconds
                    )))
                }
            };

            match result {
                Ok(output) => {
                    self.health.record_success(name.as_str(), duration);
                    return SupervisedOutcome::Completed {
                        output,
                        retries,
                        fallback_applied: None,
                    };
                }
                Err(failure) => {
                    self.health.record_failure(
                        name.as_str(),
                        duration,
                        failure.kind.trips_breaker(),
                        strategy.circuit_breaker_threshold,
                        strategy.circuit_breaker_timeout_seconds,
                    );
                    tracing::warn!(
                        stage = name.as_str(),
                        kind = failure.kind.as_str(),
                        retries,
                        error = %failure.message,
                        "stage attempt failed"
                    );

                    if failure.kind == FailureKind::BudgetExceeded
                        || failure.kind == FailureKind::Fatal
                    {
                        return SupervisedOutcome::Failed { failure, retries };
                    }

                    let may_retry = failure.kind.is_retryable()
                        && retries < strategy.max_retries
                        && !self.health.is_circuit_open(name.as_str());
                    if may_retry {
                        let delay = strategy
                            .backoff_delay_seconds(retries)
                            .max(failure.retry_after_seconds.unwrap_or(0) as f64);
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                        retries += 1;
                        continue;
                    }

                    if let Some(fallback) = &strategy.fallback_action {
                        tracing::info!(
                            stage = name.as_str(),
                            fallback = %fallback.label,
                            "retries exhausted, applying fallback"
                        );
                        return SupervisedOutcome::Completed {
                            output: StageOutput::new(fallback.result.clone()),
                            retries,
                            fallback_applied: Some(fallback.label.clone()),
                        };
                    }
                    return SupervisedOutcome::Failed { failure, retries };
                }
            }
        }
    }

    /// Delegate to the sandbox with the security scan as requested.
    pub async fn execute_code_safely(
        &self,
        code: &str,
        language: Language,
        scan_security: bool,
        token: &CancellationToken,
    ) -> Result<ExecutionResult, crate::errors::SandboxError> {
        self.sandbox
            .execute(code, language, None, scan_security, token)
            .await
    }

    /// Resolve a state outside the expected set, learning a new recovery
    /// workflow when permitted.
    pub async fn handle_unexpected_state(
        &self,
        state: &UnexpectedState,
        gateway: Option<&LlmGateway>,
        model: &str,
        auto_learn: bool,
        token: &CancellationToken,
    ) -> Result<Resolution, StageFailure> {
        self.unexpected
            .handle(state, gateway, model, auto_learn, token)
            .await
    }

    // ── Process reaper surface ──────────────────────────────────────

    pub fn detect_hanging_processes(&self) -> Vec<u32> {
        self.reaper.detect_hanging_processes()
    }

    pub fn kill_hanging_process(&self, pid: u32, force: bool) -> bool {
        self.reaper.kill_hanging_process(pid, force)
    }

    pub fn cleanup_zombie_processes(&self) -> usize {
        self.reaper.cleanup_zombie_processes()
    }

    /// Start the background hanging-process monitor for the lifetime of an
    /// orchestration.
    pub fn spawn_process_monitor(&self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        self.reaper.clone().spawn_monitor(token)
    }

    // ── Observability ───────────────────────────────────────────────

    pub fn health_status(&self) -> HealthStatus {
        self.health.overall_status()
    }

    pub fn stage_health(&self, stage: StageName) -> Option<StageHealth> {
        self.health.get(stage.as_str())
    }

    pub fn statistics(&self) -> SupervisorStatistics {
        SupervisorStatistics {
            status: self.health.overall_status(),
            stages: self.health.snapshot(),
            llm: self.llm_stats.lock().expect("llm stats lock poisoned").clone(),
            budget: self.tracker.snapshot(),
        }
    }

    /// Plain-words health report. Circuits are described as "open" or
    /// "closed"; a failure rate that would exceed 100% is reported as a
    /// counter bug instead of a percentage.
    pub fn health_report(&self) -> String {
        let stats = self.statistics();
        let mut report = String::new();
        report.push_str("=== Supervisor Health Report ===\n");
        report.push_str(&format!("overall: {}\n", stats.status.as_str()));
        for (stage, health) in &stats.stages {
            let rate = if health.has_counter_bug() {
                "counter bug (failures exceed executions)".to_string()
            } else {
                format!("{:.1}%", health.failure_rate() * 100.0)
            };
            report.push_str(&format!(
                "stage {stage}: executions {}, failures {}, failure rate {rate}, circuit {}, avg {:.2}s\n",
                health.executions,
                health.failures,
                if health.circuit_open { "open" } else { "closed" },
                health.avg_duration_seconds,
            ));
        }
        report.push_str(&format!(
            "llm: {} calls ({} cached), {} in / {} out tokens\n",
            stats.llm.calls, stats.llm.cached_calls, stats.llm.tokens_input, stats.llm.tokens_output
        ));
        report.push_str(&format!(
            "budget: ${:.4} today (limit ${:.2}), ${:.4} this month (limit ${:.2})\n",
            stats.budget.daily_cost,
            stats.budget.daily_limit,
            stats.budget.monthly_cost,
            stats.budget.monthly_limit,
        ));
        report
    }

    pub fn print_health_report(&self) {
        eprint!("{}", self.health_report());
    }
}

impl UsageSink for Supervisor {
    fn track_llm_call(&self, record: &LlmCallRecord) {
        let mut stats = self.llm_stats.lock().expect("llm stats lock poisoned");
        stats.calls += 1;
        if record.cached {
            stats.cached_calls += 1;
        }
        stats.tokens_input += record.tokens_input;
        stats.tokens_output += record.tokens_output;
        *stats.calls_by_stage.entry(record.stage.clone()).or_default() += 1;
    }
}
