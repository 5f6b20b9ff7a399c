//! Integration stage: apply the winning candidate's artifacts to the working
//! copy.

use super::{Stage, StageName, StageOutput, StageServices, require_typed};
use crate::card::Card;
use crate::context::{Context, keys};
use crate::developer::DeveloperResult;
use crate::errors::StageFailure;
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

pub struct IntegrationStage;

#[async_trait]
impl Stage for IntegrationStage {
    fn name(&self) -> StageName {
        StageName::Integration
    }

    fn setup(&self, _card: &Card, ctx: &Context) -> Result<(), StageFailure> {
        require_typed::<u32>(ctx, keys::WINNER)?;
        require_typed::<Vec<DeveloperResult>>(ctx, keys::DEVELOPER_RESULTS)?;
        Ok(())
    }

    async fn execute_stage(
        &self,
        _card: &Card,
        ctx: &Context,
        services: &StageServices,
        _token: &CancellationToken,
    ) -> Result<StageOutput, StageFailure> {
        let winner_id: u32 = require_typed(ctx, keys::WINNER)?;
        let results: Vec<DeveloperResult> = require_typed(ctx, keys::DEVELOPER_RESULTS)?;
        let approved: Vec<u32> = require_typed(ctx, keys::APPROVED_CANDIDATES)?;

        if !approved.contains(&winner_id) {
            return Err(StageFailure::contract(format!(
                "winner {winner_id} was not approved by validation"
            )));
        }
        let winner = results
            .iter()
            .find(|r| r.worker_id == winner_id)
            .ok_or_else(|| {
                StageFailure::contract(format!("winner {winner_id} missing from developer results"))
            })?;

        let target = services.work_dir.join("integrated");
        let mut applied = Vec::new();
        for file in &winner.files {
            let path = target.join(&file.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StageFailure::fatal(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
            std::fs::write(&path, &file.content).map_err(|e| {
                StageFailure::fatal(format!("cannot apply {}: {e}", file.path))
            })?;
            applied.push(path.display().to_string());
        }

        tracing::info!(winner = winner_id, files = applied.len(), "winner integrated");
        let mut output = StageOutput::new(json!({
            "winner": winner_id,
            "target": target.display().to_string(),
            "files": applied,
            "blockers": [],
        }))
        .with_context_update(keys::INTEGRATION_STATUS, json!("integrated"));
        for path in applied {
            output = output.with_artifact(path);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::developer::{FileKind, SolutionFile, WorkerProfile, WorkerStatus};

    fn winner_result() -> DeveloperResult {
        DeveloperResult {
            worker_id: 2,
            profile: WorkerProfile::Aggressive,
            status: WorkerStatus::Succeeded,
            files: vec![SolutionFile {
                path: "pkg/lib.py".to_string(),
                content: "def f():\n    return 2\n".to_string(),
                kind: FileKind::Implementation,
            }],
            notes: String::new(),
            tokens_used: 1,
            duration_seconds: 0.1,
            smoke_test: None,
            error: None,
        }
    }

    fn ctx(winner: u32, approved: &[u32]) -> Context {
        let mut ctx = Context::new();
        ctx.insert(keys::WINNER, json!(winner), "arbitration").unwrap();
        ctx.insert(
            keys::DEVELOPER_RESULTS,
            serde_json::to_value([winner_result()]).unwrap(),
            "development",
        )
        .unwrap();
        ctx.insert(keys::APPROVED_CANDIDATES, json!(approved), "validation")
            .unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_winner_files_applied_to_working_copy() {
        let dir = tempfile::tempdir().unwrap();
        let services = crate::stage::testutil::services(dir.path());

        let output = IntegrationStage
            .execute_stage(
                &Card::new("c-1", "t"),
                &ctx(2, &[2]),
                &services,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output.result["winner"], json!(2));
        let applied = dir.path().join("work/integrated/pkg/lib.py");
        assert!(applied.exists());
        assert!(
            output
                .context_updates
                .iter()
                .any(|(k, v)| k == keys::INTEGRATION_STATUS && v == &json!("integrated"))
        );
    }

    #[tokio::test]
    async fn test_unapproved_winner_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let services = crate::stage::testutil::services(dir.path());

        let err = IntegrationStage
            .execute_stage(
                &Card::new("c-1", "t"),
                &ctx(2, &[]),
                &services,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::errors::FailureKind::ContractViolation);
    }

    #[test]
    fn test_setup_requires_winner() {
        let err = IntegrationStage
            .setup(&Card::new("c-1", "t"), &Context::new())
            .unwrap_err();
        assert!(err.message.contains(keys::WINNER));
    }
}
