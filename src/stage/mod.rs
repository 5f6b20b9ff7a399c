//! Stage framework: the stage contract and its template lifecycle.
//!
//! Every concrete stage implements [`Stage::execute_stage`]; the surrounding
//! lifecycle (banner, start notification, setup, artifact storage, outcome
//! notifications, teardown) is provided by [`run_stage`] with overridable
//! default phases. Failures from any phase are caught exactly once here and
//! surface as a typed [`StageFailure`]; the supervisor decides what happens
//! next.

pub mod analysis;
pub mod arbitration;
pub mod architecture;
pub mod dependencies;
pub mod development;
pub mod integration;
pub mod review;
pub mod testing;
pub mod validation;

pub use analysis::AnalysisStage;
pub use arbitration::ArbitrationStage;
pub use architecture::ArchitectureStage;
pub use dependencies::DependenciesStage;
pub use development::DevelopmentStage;
pub use integration::IntegrationStage;
pub use review::ReviewStage;
pub use testing::TestingStage;
pub use validation::ValidationStage;

use crate::bus::{MessageBus, MessageEnvelope, MessagePriority, MessageType};
use crate::card::Card;
use crate::checkpoint::LlmExchange;
use crate::context::Context;
use crate::errors::StageFailure;
use crate::llm::LlmGateway;
use crate::rag::{ArtifactStore, ArtifactType};
use crate::sandbox::SandboxExecutor;
use async_trait::async_trait;
use console::style;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Agent name the engine's own stages use on the bus.
pub const ENGINE_AGENT: &str = "orchestrator";

/// The closed set of pipeline stages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Analysis,
    Architecture,
    Dependencies,
    Development,
    Arbitration,
    Review,
    Validation,
    Integration,
    Testing,
}

impl StageName {
    /// Every stage, in baseline pipeline order.
    pub fn all() -> [StageName; 9] {
        [
            StageName::Analysis,
            StageName::Architecture,
            StageName::Dependencies,
            StageName::Development,
            StageName::Arbitration,
            StageName::Review,
            StageName::Validation,
            StageName::Integration,
            StageName::Testing,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Analysis => "analysis",
            StageName::Architecture => "architecture",
            StageName::Dependencies => "dependencies",
            StageName::Development => "development",
            StageName::Arbitration => "arbitration",
            StageName::Review => "review",
            StageName::Validation => "validation",
            StageName::Integration => "integration",
            StageName::Testing => "testing",
        }
    }

    /// Default per-attempt timeout, overridable per stage through the
    /// supervisor's recovery strategy.
    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            StageName::Analysis => 120,
            StageName::Architecture => 180,
            StageName::Dependencies => 60,
            StageName::Development => 600,
            StageName::Arbitration => 60,
            StageName::Review => 180,
            StageName::Validation => 120,
            StageName::Integration => 180,
            StageName::Testing => 300,
        }
    }

    /// Artifact type under which this stage's result is stored.
    pub fn artifact_type(&self) -> ArtifactType {
        match self {
            StageName::Analysis => ArtifactType::ProjectAnalysis,
            StageName::Architecture => ArtifactType::ArchitectureDecision,
            StageName::Dependencies => ArtifactType::ResearchReport,
            StageName::Development => ArtifactType::DeveloperSolution,
            StageName::Arbitration => ArtifactType::ArbitrationScore,
            StageName::Review => ArtifactType::CodeReview,
            StageName::Validation => ArtifactType::TestingResult,
            StageName::Integration => ArtifactType::IntegrationResult,
            StageName::Testing => ArtifactType::TestingResult,
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analysis" => Ok(StageName::Analysis),
            "architecture" => Ok(StageName::Architecture),
            "dependencies" => Ok(StageName::Dependencies),
            "development" => Ok(StageName::Development),
            "arbitration" => Ok(StageName::Arbitration),
            "review" => Ok(StageName::Review),
            "validation" => Ok(StageName::Validation),
            "integration" => Ok(StageName::Integration),
            "testing" => Ok(StageName::Testing),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

/// Shared collaborators handed to every stage.
pub struct StageServices {
    pub bus: Arc<MessageBus>,
    pub artifacts: Arc<ArtifactStore>,
    pub gateway: Arc<LlmGateway>,
    pub sandbox: Arc<SandboxExecutor>,
    /// Per-card scratch/workspace directory for stage outputs.
    pub work_dir: PathBuf,
    pub llm_model: String,
    pub llm_max_tokens: u32,
    /// Dependencies the compatibility check refuses.
    pub incompatible_dependencies: Vec<String>,
    /// Whether the analysis stage must wait for an external approval.
    pub approval_required: bool,
    /// How long the analysis stage polls for approval before giving up.
    pub approval_timeout_secs: u64,
}

/// What a stage hands back on success.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// Result payload recorded in the stage's checkpoint record.
    pub result: Value,
    /// New context keys. The orchestrator merges these; stages never mutate
    /// the context directly.
    pub context_updates: Vec<(String, Value)>,
    /// Paths and artifact ids produced by this stage.
    pub artifacts: Vec<String>,
    /// LLM exchanges made by this stage, persisted for resume.
    pub llm_responses: Vec<LlmExchange>,
}

impl StageOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }

    pub fn with_context_update(mut self, key: &str, value: Value) -> Self {
        self.context_updates.push((key.to_string(), value));
        self
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifacts.push(artifact.into());
        self
    }

    pub fn with_llm_exchange(mut self, exchange: LlmExchange) -> Self {
        self.llm_responses.push(exchange);
        self
    }
}

/// The stage contract plus the overridable lifecycle phases.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    /// The only required override: the stage's actual work.
    async fn execute_stage(
        &self,
        card: &Card,
        ctx: &Context,
        services: &StageServices,
        token: &CancellationToken,
    ) -> Result<StageOutput, StageFailure>;

    /// Lifecycle phase 1: banner.
    fn log_start(&self, card: &Card) {
        eprintln!(
            "{} {} {}",
            style("==>").cyan().bold(),
            style(self.name().as_str()).bold(),
            style(format!("[{}] {}", card.card_id, card.title)).dim()
        );
        tracing::info!(stage = self.name().as_str(), card_id = %card.card_id, "stage starting");
    }

    /// Lifecycle phase 2: announce the stage on the bus.
    fn notify_start(&self, card: &Card, bus: &MessageBus) -> Result<(), StageFailure> {
        let msg = MessageEnvelope::new(
            ENGINE_AGENT,
            crate::bus::BROADCAST,
            MessageType::Notification,
            &card.card_id,
        )
        .with_data("type", Value::String("stage_started".to_string()))
        .with_data("stage", Value::String(self.name().as_str().to_string()));
        bus.send(&msg)
            .map_err(|e| StageFailure::fatal(format!("bus send failed: {e}")))?;
        Ok(())
    }

    /// Lifecycle phase 3: pull prerequisites out of the context. Default no-op.
    fn setup(&self, _card: &Card, _ctx: &Context) -> Result<(), StageFailure> {
        Ok(())
    }

    /// Lifecycle phase 5: store the stage result as an artifact. Returns the
    /// artifact ids written.
    fn store_result(
        &self,
        card: &Card,
        output: &StageOutput,
        artifacts: &ArtifactStore,
    ) -> Result<Vec<String>, StageFailure> {
        let content = serde_json::to_string_pretty(&output.result)
            .map_err(|e| StageFailure::fatal(format!("result serialization failed: {e}")))?;
        let id = artifacts
            .store(
                self.name().artifact_type(),
                &card.card_id,
                &card.title,
                &content,
                serde_json::Map::new(),
            )
            .map_err(|e| StageFailure::fatal(format!("artifact store failed: {e}")))?;
        Ok(vec![id])
    }

    /// Lifecycle phase 6a: success notification.
    fn notify_success(&self, card: &Card, bus: &MessageBus) -> Result<(), StageFailure> {
        let msg = MessageEnvelope::new(
            ENGINE_AGENT,
            crate::bus::BROADCAST,
            MessageType::Notification,
            &card.card_id,
        )
        .with_data("type", Value::String("stage_completed".to_string()))
        .with_data("stage", Value::String(self.name().as_str().to_string()));
        bus.send(&msg)
            .map_err(|e| StageFailure::fatal(format!("bus send failed: {e}")))?;
        Ok(())
    }

    /// Lifecycle phase 6b: failure notification. Always high priority.
    fn notify_failure(&self, card: &Card, error: &StageFailure, bus: &MessageBus) {
        let msg = MessageEnvelope::new(
            ENGINE_AGENT,
            crate::bus::BROADCAST,
            MessageType::Error,
            &card.card_id,
        )
        .with_priority(MessagePriority::High)
        .with_data("stage", Value::String(self.name().as_str().to_string()))
        .with_data("kind", Value::String(error.kind.as_str().to_string()))
        .with_data("message", Value::String(error.message.clone()));
        if let Err(e) = bus.send(&msg) {
            tracing::error!(stage = self.name().as_str(), error = %e, "failure notification lost");
        }
    }

    /// Lifecycle phase 7: cleanup hook. Default no-op.
    fn teardown(&self, _success: bool) {}
}

/// Drive one stage through the full template lifecycle.
///
/// This is the single point where stage failures are caught and converted;
/// nothing below it lets an error escape raw.
pub async fn run_stage(
    stage: &dyn Stage,
    card: &Card,
    ctx: &Context,
    services: &StageServices,
    token: &CancellationToken,
) -> Result<StageOutput, StageFailure> {
    stage.log_start(card);

    let run = async {
        stage.notify_start(card, &services.bus)?;
        stage.setup(card, ctx)?;
        let mut output = stage.execute_stage(card, ctx, services, token).await?;
        let stored = stage.store_result(card, &output, &services.artifacts)?;
        output.artifacts.extend(stored);
        Ok(output)
    };

    match run.await {
        Ok(output) => {
            if let Err(e) = stage.notify_success(card, &services.bus) {
                stage.teardown(false);
                return Err(e);
            }
            stage.teardown(true);
            Ok(output)
        }
        Err(failure) => {
            stage.notify_failure(card, &failure, &services.bus);
            stage.teardown(false);
            Err(failure)
        }
    }
}

/// Fetch a required string key from the context or fail the contract.
pub fn require_str<'c>(ctx: &'c Context, key: &str) -> Result<&'c str, StageFailure> {
    ctx.get_str(key)
        .ok_or_else(|| StageFailure::contract(format!("missing required context key '{key}'")))
}

/// Fetch and deserialize a required context key.
pub fn require_typed<T: serde::de::DeserializeOwned>(
    ctx: &Context,
    key: &str,
) -> Result<T, StageFailure> {
    let value = ctx
        .get(key)
        .ok_or_else(|| StageFailure::contract(format!("missing required context key '{key}'")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| StageFailure::contract(format!("context key '{key}' has wrong shape: {e}")))
}

/// Shared fixture for stage unit tests: a full `StageServices` wired to
/// temp-dir collaborators and a scripted provider.
#[cfg(test)]
pub(crate) mod testutil {
    use super::StageServices;
    use crate::bus::MessageBus;
    use crate::llm::{LlmGateway, ResponseCache, ScriptedProvider};
    use crate::rag::ArtifactStore;
    use crate::sandbox::SandboxExecutor;
    use crate::supervisor::budget::{BudgetConfig, CostTracker};
    use std::path::Path;
    use std::sync::Arc;

    pub(crate) fn services_with_provider(
        dir: &Path,
        provider: ScriptedProvider,
    ) -> StageServices {
        let tracker = Arc::new(CostTracker::new(BudgetConfig::default()));
        StageServices {
            bus: Arc::new(MessageBus::new(&dir.join("bus")).unwrap()),
            artifacts: Arc::new(ArtifactStore::open_default(&dir.join("rag")).unwrap()),
            gateway: Arc::new(LlmGateway::new(
                Box::new(provider),
                ResponseCache::with_default_ttl(&dir.join("cache")).unwrap(),
                tracker,
            )),
            sandbox: Arc::new(SandboxExecutor::with_defaults()),
            work_dir: dir.join("work"),
            llm_model: "test-model".to_string(),
            llm_max_tokens: 1024,
            incompatible_dependencies: Vec::new(),
            approval_required: false,
            approval_timeout_secs: 5,
        }
    }

    pub(crate) fn services(dir: &Path) -> StageServices {
        services_with_provider(dir, ScriptedProvider::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_stage_name_round_trip() {
        for name in [
            StageName::Analysis,
            StageName::Architecture,
            StageName::Dependencies,
            StageName::Development,
            StageName::Arbitration,
            StageName::Review,
            StageName::Validation,
            StageName::Integration,
            StageName::Testing,
        ] {
            assert_eq!(StageName::from_str(name.as_str()).unwrap(), name);
            let json = serde_json::to_string(&name).unwrap();
            let parsed: StageName = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, name);
        }
    }

    #[test]
    fn test_default_timeouts_match_policy() {
        assert_eq!(StageName::Development.default_timeout_secs(), 600);
        assert_eq!(StageName::Testing.default_timeout_secs(), 300);
        assert_eq!(StageName::Review.default_timeout_secs(), 180);
        assert_eq!(StageName::Dependencies.default_timeout_secs(), 60);
        assert_eq!(StageName::Analysis.default_timeout_secs(), 120);
    }

    #[test]
    fn test_require_str_reports_missing_key() {
        let ctx = Context::new();
        let err = require_str(&ctx, "adr_file").unwrap_err();
        assert_eq!(err.kind, crate::errors::FailureKind::ContractViolation);
        assert!(err.message.contains("adr_file"));
    }

    #[test]
    fn test_require_typed_rejects_wrong_shape() {
        let mut ctx = Context::new();
        ctx.insert("numbers", json!("not a list"), "t").unwrap();
        let err = require_typed::<Vec<u32>>(&ctx, "numbers").unwrap_err();
        assert!(err.message.contains("wrong shape"));
    }

    #[test]
    fn test_stage_output_builder() {
        let output = StageOutput::new(json!({"ok": true}))
            .with_context_update("winner", json!(2))
            .with_artifact("artifact-1");
        assert_eq!(output.context_updates.len(), 1);
        assert_eq!(output.artifacts, vec!["artifact-1".to_string()]);
    }
}
