//! Arbitration stage: score the competing candidates and pick the winner.
//!
//! Runs only when the plan fanned out more than one worker. Scores and the
//! winner are stored as an `arbitration_score` artifact whose metadata also
//! carries the winning technology choices for future recommendations.

use super::{Stage, StageName, StageOutput, StageServices, require_typed};
use crate::card::Card;
use crate::context::{Context, keys};
use crate::developer::{DeveloperResult, score_candidates, select_winner};
use crate::errors::StageFailure;
use crate::rag::ArtifactStore;
use async_trait::async_trait;
use serde_json::{Map, json};
use tokio_util::sync::CancellationToken;

pub struct ArbitrationStage;

#[async_trait]
impl Stage for ArbitrationStage {
    fn name(&self) -> StageName {
        StageName::Arbitration
    }

    fn setup(&self, _card: &Card, ctx: &Context) -> Result<(), StageFailure> {
        require_typed::<Vec<DeveloperResult>>(ctx, keys::DEVELOPER_RESULTS)?;
        Ok(())
    }

    async fn execute_stage(
        &self,
        card: &Card,
        ctx: &Context,
        _services: &StageServices,
        _token: &CancellationToken,
    ) -> Result<StageOutput, StageFailure> {
        let results: Vec<DeveloperResult> = require_typed(ctx, keys::DEVELOPER_RESULTS)?;

        let scores = score_candidates(&results, &card.acceptance_criteria);
        let winner = select_winner(&scores).ok_or_else(|| {
            StageFailure::contract("arbitration has no scorable candidates")
        })?;

        tracing::info!(
            winner = winner.worker_id,
            total = winner.total,
            candidates = scores.len(),
            "arbitration selected winner"
        );

        // Technologies the winning approach committed to, for the RAG
        // recommendation aggregation on future cards.
        let winning_technologies = ctx
            .get(keys::DEPENDENCIES_IDENTIFIED)
            .cloned()
            .unwrap_or_else(|| json!([]));

        Ok(StageOutput::new(json!({
            "scores": scores,
            "winner": winner.worker_id,
            "winner_total": winner.total,
            "candidates": scores.iter().map(|s| s.worker_id).collect::<Vec<_>>(),
            "winning_technologies": winning_technologies,
        }))
        .with_context_update(keys::WINNER, json!(winner.worker_id)))
    }

    /// Arbitration artifacts carry the candidate set and winner in metadata
    /// so the invariants are queryable without parsing content.
    fn store_result(
        &self,
        card: &Card,
        output: &StageOutput,
        artifacts: &ArtifactStore,
    ) -> Result<Vec<String>, StageFailure> {
        let mut metadata = Map::new();
        for key in ["candidates", "winner", "winning_technologies"] {
            if let Some(value) = output.result.get(key) {
                metadata.insert(key.to_string(), value.clone());
            }
        }
        let content = serde_json::to_string_pretty(&output.result)
            .map_err(|e| StageFailure::fatal(format!("result serialization failed: {e}")))?;
        let id = artifacts
            .store(
                self.name().artifact_type(),
                &card.card_id,
                &card.title,
                &content,
                metadata,
            )
            .map_err(|e| StageFailure::fatal(format!("artifact store failed: {e}")))?;
        Ok(vec![id])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::developer::{FileKind, SmokeTest, SolutionFile, WorkerProfile, WorkerStatus};

    fn candidate(worker_id: u32, extra_bytes: usize) -> DeveloperResult {
        DeveloperResult {
            worker_id,
            profile: WorkerProfile::for_worker(worker_id),
            status: WorkerStatus::Succeeded,
            files: vec![
                SolutionFile {
                    path: "lib.py".to_string(),
                    content: format!(
                        "# impl\ndef rotate(t):\n    return t\n{}",
                        "x = 0\n".repeat(extra_bytes)
                    ),
                    kind: FileKind::Implementation,
                },
                SolutionFile {
                    path: "test_lib.py".to_string(),
                    content: "assert rotate('a') == 'a'\n".to_string(),
                    kind: FileKind::Test,
                },
            ],
            notes: "notes".to_string(),
            tokens_used: 10,
            duration_seconds: 1.0,
            smoke_test: Some(SmokeTest {
                success: true,
                exit_code: 0,
                killed: false,
                kill_reason: None,
            }),
            error: None,
        }
    }

    fn ctx_with_results(results: &[DeveloperResult]) -> Context {
        let mut ctx = Context::new();
        ctx.insert(
            keys::DEVELOPER_RESULTS,
            serde_json::to_value(results).unwrap(),
            "development",
        )
        .unwrap();
        ctx
    }

    #[test]
    fn test_setup_requires_developer_results() {
        let err = ArbitrationStage
            .setup(&Card::new("c-1", "t"), &Context::new())
            .unwrap_err();
        assert!(err.message.contains(keys::DEVELOPER_RESULTS));
    }

    #[tokio::test]
    async fn test_winner_lands_in_context_and_result() {
        let dir = tempfile::tempdir().unwrap();
        let services = crate::stage::testutil::services(dir.path());

        let results = vec![candidate(1, 0), candidate(2, 50), candidate(3, 100)];
        let ctx = ctx_with_results(&results);

        let output = ArbitrationStage
            .execute_stage(
                &Card::new("c-2", "Integrate OAuth2 refresh"),
                &ctx,
                &services,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // Smallest artifact wins here (identical elsewhere, simplicity bonus
        // decides).
        let winner = output
            .context_updates
            .iter()
            .find(|(k, _)| k == keys::WINNER)
            .map(|(_, v)| v.as_u64().unwrap());
        assert_eq!(winner, Some(1));
        assert_eq!(output.result["candidates"], json!([1, 2, 3]));

        // The stored artifact's metadata carries the candidate set.
        let ids = ArbitrationStage
            .store_result(
                &Card::new("c-2", "Integrate OAuth2 refresh"),
                &output,
                &services.artifacts,
            )
            .unwrap();
        let artifact = services.artifacts.get(&ids[0]).unwrap();
        assert_eq!(artifact.metadata["winner"], json!(1));
        assert_eq!(artifact.metadata["candidates"], json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_no_successful_candidates_is_contract_violation() {
        let dir = tempfile::tempdir().unwrap();
        let services = crate::stage::testutil::services(dir.path());
        let mut broken = candidate(1, 0);
        broken.status = WorkerStatus::Failed;
        let ctx = ctx_with_results(&[broken]);

        let err = ArbitrationStage
            .execute_stage(
                &Card::new("c-1", "t"),
                &ctx,
                &services,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::errors::FailureKind::ContractViolation);
    }
}
