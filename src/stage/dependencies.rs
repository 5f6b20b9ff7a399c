//! Dependency verification stage. Failure here is a hard block: the pipeline
//! must not build on dependencies the deployment refuses.

use super::{Stage, StageName, StageOutput, StageServices, require_typed};
use crate::card::Card;
use crate::context::{Context, keys};
use crate::errors::StageFailure;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

pub struct DependenciesStage;

#[async_trait]
impl Stage for DependenciesStage {
    fn name(&self) -> StageName {
        StageName::Dependencies
    }

    fn setup(&self, _card: &Card, ctx: &Context) -> Result<(), StageFailure> {
        require_typed::<Vec<String>>(ctx, keys::DEPENDENCIES_IDENTIFIED)?;
        Ok(())
    }

    async fn execute_stage(
        &self,
        _card: &Card,
        ctx: &Context,
        services: &StageServices,
        _token: &CancellationToken,
    ) -> Result<StageOutput, StageFailure> {
        let identified: Vec<String> = require_typed(ctx, keys::DEPENDENCIES_IDENTIFIED)?;

        let blocked: Vec<String> = identified
            .iter()
            .filter(|dep| {
                services
                    .incompatible_dependencies
                    .iter()
                    .any(|bad| dep.eq_ignore_ascii_case(bad))
            })
            .cloned()
            .collect();
        if !blocked.is_empty() {
            return Err(StageFailure::fatal(format!(
                "incompatible dependencies declared: {}",
                blocked.join(", ")
            )));
        }

        std::fs::create_dir_all(&services.work_dir)
            .map_err(|e| StageFailure::fatal(format!("cannot create work dir: {e}")))?;
        let requirements_path = services.work_dir.join("requirements.txt");
        let mut body = identified.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        std::fs::write(&requirements_path, body)
            .map_err(|e| StageFailure::fatal(format!("cannot write requirements file: {e}")))?;

        let requirements_str = requirements_path.display().to_string();
        Ok(StageOutput::new(json!({
            "verified": identified,
            "requirements_file": requirements_str,
        }))
        .with_context_update(keys::REQUIREMENTS_FILE, Value::String(requirements_str.clone()))
        .with_artifact(requirements_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn services(dir: &std::path::Path, incompatible: Vec<String>) -> StageServices {
        let mut services = crate::stage::testutil::services(dir);
        services.incompatible_dependencies = incompatible;
        services
    }

    fn ctx_with_deps(deps: &[&str]) -> Context {
        let mut ctx = Context::new();
        ctx.insert(keys::DEPENDENCIES_IDENTIFIED, json!(deps), "architecture")
            .unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_compatible_dependencies_produce_requirements_file() {
        let dir = tempdir().unwrap();
        let services = services(dir.path(), vec![]);
        let ctx = ctx_with_deps(&["jwt", "redis"]);

        let output = DependenciesStage
            .execute_stage(
                &Card::new("c-1", "t"),
                &ctx,
                &services,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let path = output
            .context_updates
            .iter()
            .find(|(k, _)| k == keys::REQUIREMENTS_FILE)
            .map(|(_, v)| v.as_str().unwrap().to_string())
            .unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "jwt\nredis\n");
    }

    #[tokio::test]
    async fn test_incompatible_dependency_is_a_hard_block() {
        let dir = tempdir().unwrap();
        let services = services(dir.path(), vec!["leftpad".to_string()]);
        let ctx = ctx_with_deps(&["jwt", "LeftPad"]);

        let err = DependenciesStage
            .execute_stage(
                &Card::new("c-1", "t"),
                &ctx,
                &services,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::errors::FailureKind::Fatal);
        assert!(err.message.contains("LeftPad"));
    }

    #[test]
    fn test_setup_requires_identified_dependencies() {
        let err = DependenciesStage
            .setup(&Card::new("c-1", "t"), &Context::new())
            .unwrap_err();
        assert!(err.message.contains(keys::DEPENDENCIES_IDENTIFIED));
    }
}
