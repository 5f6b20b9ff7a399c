//! Top-level controller: plan the stage list, wire the collaborators, drive
//! the loop under supervision, and emit the final report.

mod report;

pub use report::{RunReport, StageSummary};

use crate::bus::MessageBus;
use crate::card::{Board, Card};
use crate::checkpoint::{CheckpointManager, StageRecord, StageStatus};
use crate::context::{Context, keys};
use crate::engine_config::{EngineConfig, ProviderKind};
use crate::errors::StageFailure;
use crate::llm::{
    CompletionProvider, HttpProvider, LlmGateway, ResponseCache, ScriptedProvider, UsageSink,
};
use crate::planner::{Planner, WorkflowPlan};
use crate::rag::{ArtifactStore, ArtifactType};
use crate::sandbox::SandboxExecutor;
use crate::stage::{
    AnalysisStage, ArbitrationStage, ArchitectureStage, DependenciesStage, DevelopmentStage,
    ENGINE_AGENT, IntegrationStage, ReviewStage, Stage, StageName, StageServices, TestingStage,
    ValidationStage, development::PARALLEL_DEVELOPERS_KEY,
};
use crate::supervisor::{
    CostTracker, RecoveryStrategy, Resolution, SupervisedOutcome, Supervisor, UnexpectedState,
};
use anyhow::{Context as _, Result};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Orchestrator {
    config: EngineConfig,
    bus: Arc<MessageBus>,
    artifacts: Arc<ArtifactStore>,
    sandbox: Arc<SandboxExecutor>,
    supervisor: Arc<Supervisor>,
    gateway: Arc<LlmGateway>,
    checkpoints: CheckpointManager,
    planner: Planner,
}

impl Orchestrator {
    /// Build every collaborator for one pipeline run. Lifetime of all shared
    /// state is exactly one orchestration.
    pub fn new(config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.workspace_dir)
            .with_context(|| format!("Failed to create {}", config.workspace_dir.display()))?;

        let bus = Arc::new(MessageBus::new(&config.mailbox_root)?);
        let artifacts = Arc::new(ArtifactStore::open_default(&config.artifact_store_dir)?);
        let sandbox = Arc::new(SandboxExecutor::with_defaults());
        let tracker = Arc::new(CostTracker::new(config.budget_config()));
        let supervisor = Arc::new(Supervisor::new(
            tracker.clone(),
            sandbox.clone(),
            artifacts.clone(),
        ));

        let cache = ResponseCache::new(
            &config.llm_cache_dir,
            chrono::Duration::days(config.cache_ttl_days),
        )?;
        let sink: Arc<dyn UsageSink> = supervisor.clone();
        let gateway = Arc::new(
            LlmGateway::new(build_provider(&config)?, cache, tracker).with_usage_sink(sink),
        );

        register_strategies(&supervisor, &config);

        let checkpoints = CheckpointManager::new(&config.checkpoint_dir)?;
        let planner = Planner::new(config.planner.clone());

        Ok(Self {
            config,
            bus,
            artifacts,
            sandbox,
            supervisor,
            gateway,
            checkpoints,
            planner,
        })
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn report_path(&self, card_id: &str) -> std::path::PathBuf {
        self.config.checkpoint_dir.join(format!("{card_id}.report.json"))
    }

    /// Run (or resume) the pipeline for one card. Pre-flight errors return
    /// `Err`; anything after the checkpoint is bound lands in the report.
    pub async fn run_card(&self, card_id: &str) -> Result<RunReport> {
        let mut board = Board::load(&self.config.board_file)?;
        let card = board
            .find_card(card_id)
            .ok_or_else(|| {
                anyhow::anyhow!("card {card_id} not found in {}", self.config.board_file.display())
            })?
            .clone();

        self.bus
            .register(ENGINE_AGENT, vec!["orchestration".to_string()], "active")?;

        let plan = self.planner.plan(&card);
        tracing::info!(
            card_id,
            complexity = plan.complexity.as_str(),
            developers = plan.parallel_developers,
            stages = plan.stages.len(),
            "workflow planned"
        );

        let mut ctx = self.bind_checkpoint(&card, &plan)?;
        self.move_card(&mut board, &card, "in_progress")?;

        let services = StageServices {
            bus: self.bus.clone(),
            artifacts: self.artifacts.clone(),
            gateway: self.gateway.clone(),
            sandbox: self.sandbox.clone(),
            work_dir: self.config.card_work_dir(card_id),
            llm_model: self.config.model.clone(),
            llm_max_tokens: self.config.llm_max_tokens,
            incompatible_dependencies: self.config.incompatible_dependencies.clone(),
            approval_required: self.config.approval_required,
            approval_timeout_secs: self.config.approval_timeout_secs,
        };

        // The one long-lived background task of a run.
        let run_token = CancellationToken::new();
        let monitor = self.supervisor.spawn_process_monitor(run_token.child_token());

        let progress = ProgressBar::new(plan.stages.len() as u64);
        progress.set_style(
            ProgressStyle::with_template("{bar:24} {pos}/{len} {msg}")
                .expect("static progress template"),
        );
        progress.set_position(
            self.checkpoints
                .current()
                .map(|cp| cp.settled_stages().len() as u64)
                .unwrap_or(0),
        );

        let mut fallbacks_applied: Vec<(String, String)> = Vec::new();
        let outcome = self
            .drive_stages(
                &card,
                &plan,
                &mut ctx,
                &services,
                &run_token,
                &progress,
                &mut fallbacks_applied,
            )
            .await;

        run_token.cancel();
        monitor.abort();
        progress.finish_and_clear();

        let report = match outcome {
            StageLoopOutcome::Completed => {
                self.checkpoints.mark_completed()?;
                self.move_card(&mut board, &card, "done")?;
                self.build_report(&card, &ctx, None, fallbacks_applied)
            }
            StageLoopOutcome::Failed {
                stage,
                failure,
                recovery_hint,
            } => {
                // Best effort: the checkpoint may already be terminal.
                let _ = self.checkpoints.mark_failed(&failure.message);
                self.move_card(&mut board, &card, "failed")?;
                let mut report =
                    self.build_report(&card, &ctx, Some((stage, failure)), fallbacks_applied);
                if let Some(hint) = recovery_hint {
                    report.error_message = report
                        .error_message
                        .map(|m| format!("{m}\nrecovery hint: {hint}"));
                }
                report
            }
        };

        report.save(&self.report_path(card_id))?;
        Ok(report)
    }

    /// Bind the run to its checkpoint: resume when possible, create (and
    /// pre-record planner skips) otherwise. Returns the working context.
    fn bind_checkpoint(&self, card: &Card, plan: &WorkflowPlan) -> Result<Context> {
        if self.checkpoints.exists(&card.card_id) {
            if self.checkpoints.can_resume(&card.card_id) {
                let checkpoint = self.checkpoints.resume(&card.card_id)?;
                tracing::info!(
                    card_id = %card.card_id,
                    resume_count = checkpoint.resume_count,
                    "resuming from checkpoint"
                );
                let mut ctx =
                    Context::from_value(&checkpoint.execution_context).unwrap_or_default();
                self.seed_context(&mut ctx, card, plan, true)?;
                return Ok(ctx);
            }
            let status = self.checkpoints.load(&card.card_id)?.status;
            anyhow::bail!(
                "checkpoint for {} is not resumable (status {})",
                card.card_id,
                status.as_str()
            );
        }

        let mut ctx = Context::new();
        self.seed_context(&mut ctx, card, plan, false)?;
        self.checkpoints
            .create(&card.card_id, plan.stages.len(), ctx.to_value())?;
        // Planner-chosen skips are settled up front, distinct from any
        // runtime circuit skip.
        for stage in &plan.skip_stages {
            let now = Utc::now();
            self.checkpoints.save_stage(StageRecord {
                stage_name: *stage,
                status: StageStatus::Skipped,
                start_time: now,
                end_time: Some(now),
                duration_seconds: 0.0,
                result: None,
                artifacts: Vec::new(),
                llm_responses: Vec::new(),
                error_message: None,
                retry_count: 0,
                skip_reason: Some("planned".to_string()),
            })?;
        }
        Ok(ctx)
    }

    /// Seed the orchestrator-owned context keys. On resume only the missing
    /// ones are written (keys are write-once).
    fn seed_context(
        &self,
        ctx: &mut Context,
        card: &Card,
        plan: &WorkflowPlan,
        resuming: bool,
    ) -> Result<()> {
        let seeds = [
            (
                keys::RAG_INSIGHTS,
                serde_json::to_value(self.artifacts.recommendations(&card.task_text()))?,
            ),
            (PARALLEL_DEVELOPERS_KEY, json!(plan.parallel_developers)),
            ("execution_strategy", json!(plan.execution_strategy)),
        ];
        for (key, value) in seeds {
            if resuming && ctx.contains(key) {
                continue;
            }
            ctx.insert(key, value, ENGINE_AGENT)
                .map_err(|e| anyhow::anyhow!("context seed collision: {e}"))?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_stages(
        &self,
        card: &Card,
        plan: &WorkflowPlan,
        ctx: &mut Context,
        services: &StageServices,
        run_token: &CancellationToken,
        progress: &ProgressBar,
        fallbacks_applied: &mut Vec<(String, String)>,
    ) -> StageLoopOutcome {
        while let Some(stage_name) = self.checkpoints.next_stage(&plan.stages) {
            progress.set_message(stage_name.as_str().to_string());
            if let Err(e) = self.checkpoints.set_current_stage(stage_name) {
                return StageLoopOutcome::fatal(stage_name, e.to_string());
            }

            let stage = stage_impl(stage_name);
            let start_time = Utc::now();
            let started = std::time::Instant::now();
            let outcome = self
                .supervisor
                .execute_with_supervision(stage.as_ref(), card, ctx, services, run_token)
                .await;
            let duration = started.elapsed().as_secs_f64();

            match outcome {
                SupervisedOutcome::Completed {
                    output,
                    retries,
                    fallback_applied,
                } => {
                    if let Some(label) = &fallback_applied {
                        fallbacks_applied.push((stage_name.as_str().to_string(), label.clone()));
                    }
                    if let Err(collision) =
                        ctx.merge(output.context_updates.clone(), stage_name.as_str())
                    {
                        return StageLoopOutcome::fatal(stage_name, collision.to_string());
                    }

                    let mut result = output.result.clone();
                    if let (Some(obj), Some(label)) = (result.as_object_mut(), &fallback_applied) {
                        obj.insert("fallback_applied".to_string(), json!(label));
                    }
                    let record = StageRecord {
                        stage_name,
                        status: StageStatus::Completed,
                        start_time,
                        end_time: Some(Utc::now()),
                        duration_seconds: duration,
                        result: Some(result),
                        artifacts: output.artifacts.clone(),
                        llm_responses: output.llm_responses.clone(),
                        error_message: None,
                        retry_count: retries,
                        skip_reason: None,
                    };
                    if let Err(e) = self
                        .checkpoints
                        .save_stage(record)
                        .and_then(|_| self.checkpoints.set_execution_context(ctx.to_value()))
                    {
                        return StageLoopOutcome::fatal(stage_name, e.to_string());
                    }
                    progress.inc(1);
                }
                SupervisedOutcome::Skipped { reason, fallback } => {
                    let record = StageRecord {
                        stage_name,
                        status: StageStatus::Skipped,
                        start_time,
                        end_time: Some(Utc::now()),
                        duration_seconds: duration,
                        result: fallback.as_ref().map(|fb| fb.result.clone()),
                        artifacts: Vec::new(),
                        llm_responses: Vec::new(),
                        error_message: None,
                        retry_count: 0,
                        skip_reason: Some(reason.clone()),
                    };
                    if let Err(e) = self.checkpoints.save_stage(record) {
                        return StageLoopOutcome::fatal(stage_name, e.to_string());
                    }
                    progress.inc(1);

                    if fallback.is_some() {
                        // A configured fallback makes a circuit skip
                        // non-fatal; the pipeline moves on.
                        fallbacks_applied
                            .push((stage_name.as_str().to_string(), reason.clone()));
                        continue;
                    }
                    return StageLoopOutcome::Failed {
                        stage: stage_name,
                        failure: StageFailure::new(
                            crate::errors::FailureKind::CircuitOpen,
                            format!("stage skipped: {reason}"),
                        ),
                        recovery_hint: None,
                    };
                }
                SupervisedOutcome::Failed { failure, retries } => {
                    let record = StageRecord {
                        stage_name,
                        status: StageStatus::Failed,
                        start_time,
                        end_time: Some(Utc::now()),
                        duration_seconds: duration,
                        result: None,
                        artifacts: Vec::new(),
                        llm_responses: Vec::new(),
                        error_message: Some(failure.message.clone()),
                        retry_count: retries,
                        skip_reason: None,
                    };
                    let _ = self.checkpoints.save_stage(record);

                    let recovery_hint = self.try_learn_recovery(card, stage_name, &failure).await;
                    return StageLoopOutcome::Failed {
                        stage: stage_name,
                        failure,
                        recovery_hint,
                    };
                }
            }
        }
        StageLoopOutcome::Completed
    }

    /// Feed terminal contract failures through the unexpected-state handler
    /// so the next run can reuse whatever recovery the engine learns now.
    async fn try_learn_recovery(
        &self,
        card: &Card,
        stage: StageName,
        failure: &StageFailure,
    ) -> Option<String> {
        if failure.kind != crate::errors::FailureKind::ContractViolation {
            return None;
        }
        let state = UnexpectedState {
            card_id: card.card_id.clone(),
            stage: stage.as_str().to_string(),
            current_state: format!("failed:{}", failure.kind),
            expected_states: vec!["completed".to_string()],
            context: json!({"error": failure.message}),
        };
        match self
            .supervisor
            .handle_unexpected_state(
                &state,
                Some(&self.gateway),
                &self.config.model,
                true,
                &CancellationToken::new(),
            )
            .await
        {
            Ok(Resolution::Reused { workflow, .. }) | Ok(Resolution::Learned { workflow, .. }) => {
                Some(workflow)
            }
            Ok(Resolution::Unresolved) => None,
            Err(e) => {
                tracing::warn!(error = %e, "unexpected-state handling failed");
                None
            }
        }
    }

    fn build_report(
        &self,
        card: &Card,
        ctx: &Context,
        failure: Option<(StageName, StageFailure)>,
        fallbacks_applied: Vec<(String, String)>,
    ) -> RunReport {
        let checkpoint = self
            .checkpoints
            .current()
            .expect("checkpoint bound before reporting");
        let stats = self.supervisor.statistics();
        let (failed_stage, error_kind, error_message) = match failure {
            Some((stage, failure)) => (
                Some(stage.as_str().to_string()),
                Some(failure.kind.as_str().to_string()),
                Some(failure.message),
            ),
            None => (None, None, None),
        };

        RunReport {
            card_id: card.card_id.clone(),
            card_title: card.title.clone(),
            terminal_status: if failed_stage.is_none() {
                "completed".to_string()
            } else {
                "failed".to_string()
            },
            failed_stage,
            error_kind,
            error_message,
            fallbacks_applied,
            stages: RunReport::stage_summaries(&checkpoint),
            total_cost: stats.budget.total_cost,
            production_ready: ctx.get_bool(keys::PRODUCTION_READY),
            artifact_ids: RunReport::collect_artifacts(&checkpoint),
            checkpoint_path: self
                .checkpoints
                .checkpoint_path(&card.card_id)
                .display()
                .to_string(),
            resume_count: checkpoint.resume_count,
            supervisor: stats,
        }
    }

    /// Move the card's kanban column and record the move as an artifact.
    fn move_card(&self, board: &mut Board, card: &Card, column: &str) -> Result<()> {
        let current = board
            .find_card(&card.card_id)
            .map(|c| c.column.clone())
            .unwrap_or_default();
        if current == column {
            return Ok(());
        }
        board.set_column(&card.card_id, column);
        board.save(&self.config.board_file)?;
        self.artifacts.store(
            ArtifactType::KanbanEvent,
            &card.card_id,
            &card.title,
            &format!("card moved from '{current}' to '{column}'"),
            serde_json::Map::new(),
        )?;
        Ok(())
    }
}

enum StageLoopOutcome {
    Completed,
    Failed {
        stage: StageName,
        failure: StageFailure,
        recovery_hint: Option<String>,
    },
}

impl StageLoopOutcome {
    fn fatal(stage: StageName, message: String) -> Self {
        Self::Failed {
            stage,
            failure: StageFailure::fatal(message),
            recovery_hint: None,
        }
    }
}

fn stage_impl(name: StageName) -> Box<dyn Stage> {
    match name {
        StageName::Analysis => Box::new(AnalysisStage),
        StageName::Architecture => Box::new(ArchitectureStage),
        StageName::Dependencies => Box::new(DependenciesStage),
        StageName::Development => Box::new(DevelopmentStage),
        StageName::Arbitration => Box::new(ArbitrationStage),
        StageName::Review => Box::new(ReviewStage),
        StageName::Validation => Box::new(ValidationStage),
        StageName::Integration => Box::new(IntegrationStage),
        StageName::Testing => Box::new(TestingStage),
    }
}

fn register_strategies(supervisor: &Supervisor, config: &EngineConfig) {
    for stage in StageName::all() {
        let mut strategy = RecoveryStrategy::for_stage(stage);
        if let Some(timeout) = config.stage_timeouts.get(stage.as_str()) {
            strategy.timeout_seconds = *timeout;
        }
        if let Some(retries) = config.stage_max_retries.get(stage.as_str()) {
            strategy.max_retries = *retries;
        }
        if !config.supervision {
            // Supervision off: single attempt, breaker effectively disabled.
            strategy.max_retries = 0;
            strategy.circuit_breaker_threshold = u32::MAX;
        }
        supervisor.register_stage(stage, strategy);
    }
}

fn build_provider(config: &EngineConfig) -> Result<Box<dyn CompletionProvider>> {
    match config.provider {
        ProviderKind::Http => {
            let api_key = std::env::var(&config.api_key_env).with_context(|| {
                format!("missing API key environment variable {}", config.api_key_env)
            })?;
            Ok(Box::new(HttpProvider::new(&config.api_base, &api_key)))
        }
        ProviderKind::Scripted => Ok(Box::new(default_scripted_provider())),
    }
}

/// Offline provider with enough canned shape-correct answers to drive a full
/// pipeline end to end.
fn default_scripted_provider() -> ScriptedProvider {
    let worker_envelope = json!({
        "implementation_files": [{
            "path": "solution.py",
            "content": "# scripted offline candidate\ndef solve():\n    return 'done'\n",
        }],
        "test_files": [{
            "path": "test_solution.py",
            "content": "assert solve() == 'done'\nprint('suite passed')\n",
        }],
        "notes": "offline scripted candidate",
    })
    .to_string();
    let adr_envelope = json!({
        "adr": "# ADR\nOffline scripted decision: implement directly with the standard library.",
        "dependencies": ["python-stdlib"],
    })
    .to_string();

    ScriptedProvider::new()
        .with_rule("## OUTPUT FORMAT", &worker_envelope)
        .with_rule("## ANALYSIS", &adr_envelope)
        .with_rule("## CARD", "Offline analysis: the task is well understood and low risk.")
        .with_default("{}")
}
