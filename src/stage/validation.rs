//! Validation stage: run each candidate's declared tests in the sandbox and
//! approve the ones whose suite passes.

use super::{Stage, StageName, StageOutput, StageServices, require_typed};
use crate::card::Card;
use crate::context::{Context, keys};
use crate::developer::{DeveloperResult, combine_files, detect_language};
use crate::errors::StageFailure;
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

pub struct ValidationStage;

#[async_trait]
impl Stage for ValidationStage {
    fn name(&self) -> StageName {
        StageName::Validation
    }

    fn setup(&self, _card: &Card, ctx: &Context) -> Result<(), StageFailure> {
        require_typed::<Vec<DeveloperResult>>(ctx, keys::DEVELOPER_RESULTS)?;
        Ok(())
    }

    async fn execute_stage(
        &self,
        _card: &Card,
        ctx: &Context,
        services: &StageServices,
        token: &CancellationToken,
    ) -> Result<StageOutput, StageFailure> {
        let results: Vec<DeveloperResult> = require_typed(ctx, keys::DEVELOPER_RESULTS)?;

        let mut approved = Vec::new();
        let mut runs = Vec::new();
        for candidate in results.iter().filter(|r| r.succeeded()) {
            if candidate.test_files().count() == 0 {
                runs.push(json!({
                    "worker_id": candidate.worker_id,
                    "approved": false,
                    "reason": "no tests declared",
                }));
                continue;
            }

            let script = combine_files(&candidate.files);
            let language = detect_language(&candidate.files);
            let run = services
                .sandbox
                .execute(&script, language, None, true, token)
                .await
                .map_err(|e| StageFailure::sandbox(format!("validation run failed: {e}")))?;

            if run.success {
                approved.push(candidate.worker_id);
            }
            runs.push(json!({
                "worker_id": candidate.worker_id,
                "approved": run.success,
                "exit_code": run.exit_code,
                "killed": run.killed,
            }));
        }

        tracing::info!(approved = approved.len(), "validation finished");
        Ok(StageOutput::new(json!({"runs": runs, "approved": approved}))
            .with_context_update(keys::APPROVED_CANDIDATES, json!(approved)))
    }
}
