//! Development stage: fan out to N competing workers.
//!
//! With a single worker the sole successful candidate is also the winner
//! (arbitration is skipped by the planner); with several workers the winner
//! is chosen by the arbitration stage that follows.

use super::{Stage, StageName, StageOutput, StageServices, require_str};
use crate::card::Card;
use crate::context::{Context, keys};
use crate::developer::{DeveloperInvoker, DeveloperResult};
use crate::errors::StageFailure;
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Context key the orchestrator seeds from the workflow plan.
pub const PARALLEL_DEVELOPERS_KEY: &str = "parallel_developers";

pub struct DevelopmentStage;

#[async_trait]
impl Stage for DevelopmentStage {
    fn name(&self) -> StageName {
        StageName::Development
    }

    fn setup(&self, _card: &Card, ctx: &Context) -> Result<(), StageFailure> {
        require_str(ctx, keys::ADR_FILE)?;
        Ok(())
    }

    async fn execute_stage(
        &self,
        card: &Card,
        ctx: &Context,
        services: &StageServices,
        token: &CancellationToken,
    ) -> Result<StageOutput, StageFailure> {
        let adr_path = require_str(ctx, keys::ADR_FILE)?;
        let adr_content = std::fs::read_to_string(adr_path).unwrap_or_default();

        let parallel = ctx
            .get(PARALLEL_DEVELOPERS_KEY)
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32;

        let invoker = DeveloperInvoker::from_services(services);
        let (results, exchanges) = invoker.invoke(card, &adr_content, parallel, token).await?;

        let succeeded: Vec<u32> = results
            .iter()
            .filter(|r| r.succeeded())
            .map(|r| r.worker_id)
            .collect();
        tracing::info!(
            workers = results.len(),
            succeeded = succeeded.len(),
            "development fan-out finished"
        );

        let mut output = StageOutput::new(json!({
            "worker_count": results.len(),
            "succeeded": succeeded,
            "total_tokens": results.iter().map(|r| r.tokens_used).sum::<u64>(),
        }))
        .with_context_update(
            keys::DEVELOPER_RESULTS,
            serde_json::to_value(&results)
                .map_err(|e| StageFailure::fatal(format!("result serialization failed: {e}")))?,
        );

        // Sole-worker runs have no arbitration stage; the only candidate is
        // the winner, subject to validation downstream.
        if parallel == 1
            && let Some(sole) = results.iter().find(|r| DeveloperResult::succeeded(r))
        {
            output = output.with_context_update(keys::WINNER, json!(sole.worker_id));
        }

        for exchange in exchanges {
            output = output.with_llm_exchange(exchange);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedProvider;
    use tempfile::tempdir;

    fn worker_envelope() -> String {
        json!({
            "implementation_files": [
                {"path": "lib.py", "content": "def rotate(t):\n    return t + '-next'\n"}
            ],
            "test_files": [
                {"path": "test_lib.py", "content": "assert rotate('a') == 'a-next'\n"}
            ],
            "notes": "simple rotation"
        })
        .to_string()
    }

    fn services(dir: &std::path::Path) -> StageServices {
        crate::stage::testutil::services_with_provider(
            dir,
            ScriptedProvider::new().with_default(&worker_envelope()),
        )
    }

    fn ctx(dir: &std::path::Path, parallel: u32) -> Context {
        let adr = dir.join("adr.md");
        std::fs::write(&adr, "# ADR\nrotate tokens").unwrap();
        let mut ctx = Context::new();
        ctx.insert(
            keys::ADR_FILE,
            json!(adr.display().to_string()),
            "architecture",
        )
        .unwrap();
        ctx.insert(PARALLEL_DEVELOPERS_KEY, json!(parallel), "plan")
            .unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_single_worker_becomes_winner() {
        let dir = tempdir().unwrap();
        let services = services(dir.path());
        let ctx = ctx(dir.path(), 1);

        let output = DevelopmentStage
            .execute_stage(
                &Card::new("c-1", "Fix typo"),
                &ctx,
                &services,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let winner = output
            .context_updates
            .iter()
            .find(|(k, _)| k == keys::WINNER)
            .map(|(_, v)| v.as_u64().unwrap());
        assert_eq!(winner, Some(1));
    }

    #[tokio::test]
    async fn test_parallel_run_defers_winner_to_arbitration() {
        let dir = tempdir().unwrap();
        let services = services(dir.path());
        let ctx = ctx(dir.path(), 3);

        let output = DevelopmentStage
            .execute_stage(
                &Card::new("c-2", "Integrate OAuth2 refresh"),
                &ctx,
                &services,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(
            !output.context_updates.iter().any(|(k, _)| k == keys::WINNER),
            "winner selection belongs to the arbitration stage"
        );
        let results = output
            .context_updates
            .iter()
            .find(|(k, _)| k == keys::DEVELOPER_RESULTS)
            .map(|(_, v)| v.as_array().unwrap().len());
        assert_eq!(results, Some(3));
    }

    #[test]
    fn test_setup_requires_adr() {
        let err = DevelopmentStage
            .setup(&Card::new("c-1", "t"), &Context::new())
            .unwrap_err();
        assert!(err.message.contains(keys::ADR_FILE));
    }
}
