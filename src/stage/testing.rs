//! Final testing stage: run the integrated winner's suite in the sandbox and
//! declare whether the card is production ready.

use super::{Stage, StageName, StageOutput, StageServices, require_str, require_typed};
use crate::card::Card;
use crate::context::{Context, keys};
use crate::developer::{DeveloperResult, combine_files, detect_language};
use crate::errors::StageFailure;
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

pub struct TestingStage;

#[async_trait]
impl Stage for TestingStage {
    fn name(&self) -> StageName {
        StageName::Testing
    }

    fn setup(&self, _card: &Card, ctx: &Context) -> Result<(), StageFailure> {
        require_str(ctx, keys::INTEGRATION_STATUS)?;
        require_typed::<u32>(ctx, keys::WINNER)?;
        Ok(())
    }

    async fn execute_stage(
        &self,
        _card: &Card,
        ctx: &Context,
        services: &StageServices,
        token: &CancellationToken,
    ) -> Result<StageOutput, StageFailure> {
        let winner_id: u32 = require_typed(ctx, keys::WINNER)?;
        let results: Vec<DeveloperResult> = require_typed(ctx, keys::DEVELOPER_RESULTS)?;
        let winner = results
            .iter()
            .find(|r| r.worker_id == winner_id)
            .ok_or_else(|| {
                StageFailure::contract(format!("winner {winner_id} missing from developer results"))
            })?;

        let script = combine_files(&winner.files);
        let language = detect_language(&winner.files);
        let run = services
            .sandbox
            .execute(&script, language, None, true, token)
            .await
            .map_err(|e| StageFailure::sandbox(format!("final suite failed to run: {e}")))?;

        let production_ready = run.success;
        let testing_status = if production_ready { "passed" } else { "failed" };
        tracing::info!(
            winner = winner_id,
            testing_status,
            exit_code = run.exit_code,
            "final suite finished"
        );

        Ok(StageOutput::new(json!({
            "testing_status": testing_status,
            "production_ready": production_ready,
            "exit_code": run.exit_code,
            "stdout": run.stdout,
            "stderr": run.stderr,
            "duration_seconds": run.duration_seconds,
        }))
        .with_context_update(keys::TESTING_STATUS, json!(testing_status))
        .with_context_update(keys::PRODUCTION_READY, json!(production_ready)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::developer::{FileKind, SolutionFile, WorkerProfile, WorkerStatus};

    fn ctx(test_body: &str) -> Context {
        let result = DeveloperResult {
            worker_id: 1,
            profile: WorkerProfile::Conservative,
            status: WorkerStatus::Succeeded,
            files: vec![
                SolutionFile {
                    path: "lib.py".to_string(),
                    content: "def triple(x):\n    return x * 3\n".to_string(),
                    kind: FileKind::Implementation,
                },
                SolutionFile {
                    path: "test_lib.py".to_string(),
                    content: test_body.to_string(),
                    kind: FileKind::Test,
                },
            ],
            notes: String::new(),
            tokens_used: 1,
            duration_seconds: 0.1,
            smoke_test: None,
            error: None,
        };

        let mut ctx = Context::new();
        ctx.insert(keys::WINNER, json!(1), "development").unwrap();
        ctx.insert(
            keys::DEVELOPER_RESULTS,
            serde_json::to_value([result]).unwrap(),
            "development",
        )
        .unwrap();
        ctx.insert(keys::INTEGRATION_STATUS, json!("integrated"), "integration")
            .unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_passing_suite_is_production_ready() {
        let dir = tempfile::tempdir().unwrap();
        let services = crate::stage::testutil::services(dir.path());

        let output = TestingStage
            .execute_stage(
                &Card::new("c-1", "t"),
                &ctx("assert triple(2) == 6\nprint('suite passed')\n"),
                &services,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output.result["testing_status"], json!("passed"));
        assert!(
            output
                .context_updates
                .iter()
                .any(|(k, v)| k == keys::PRODUCTION_READY && v == &json!(true))
        );
    }

    #[tokio::test]
    async fn test_failing_suite_is_not_production_ready() {
        let dir = tempfile::tempdir().unwrap();
        let services = crate::stage::testutil::services(dir.path());

        let output = TestingStage
            .execute_stage(
                &Card::new("c-1", "t"),
                &ctx("assert triple(2) == 7\n"),
                &services,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output.result["testing_status"], json!("failed"));
        assert!(
            output
                .context_updates
                .iter()
                .any(|(k, v)| k == keys::PRODUCTION_READY && v == &json!(false))
        );
    }

    #[test]
    fn test_setup_requires_integration_first() {
        let err = TestingStage
            .setup(&Card::new("c-1", "t"), &Context::new())
            .unwrap_err();
        assert!(err.message.contains(keys::INTEGRATION_STATUS));
    }
}
