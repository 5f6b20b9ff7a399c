//! Architecture stage: turns the analysis report into an ADR and the list of
//! dependencies the solution will need.

use super::{Stage, StageName, StageOutput, StageServices, require_str};
use crate::card::Card;
use crate::checkpoint::LlmExchange;
use crate::context::{Context, keys};
use crate::errors::StageFailure;
use crate::llm::{ChatMessage, CompletionRequest, prompt_hash};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// The structured envelope the architecture agent must return.
#[derive(Debug, Deserialize)]
struct AdrEnvelope {
    adr: String,
    #[serde(default)]
    dependencies: Vec<String>,
}

pub struct ArchitectureStage;

#[async_trait]
impl Stage for ArchitectureStage {
    fn name(&self) -> StageName {
        StageName::Architecture
    }

    fn setup(&self, _card: &Card, ctx: &Context) -> Result<(), StageFailure> {
        require_str(ctx, keys::ANALYSIS_REPORT)?;
        Ok(())
    }

    async fn execute_stage(
        &self,
        card: &Card,
        ctx: &Context,
        services: &StageServices,
        _token: &CancellationToken,
    ) -> Result<StageOutput, StageFailure> {
        let report_path = require_str(ctx, keys::ANALYSIS_REPORT)?;
        let analysis = std::fs::read_to_string(report_path).unwrap_or_else(|_| {
            // The path may point at a pruned workspace after resume; the card
            // text still gives the agent enough to work from.
            card.task_text()
        });

        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(
                    "You are the architecture agent. Produce an architecture decision \
                     record for the task and name the dependencies the implementation \
                     will need. Respond with a single JSON object: \
                     {\"adr\": \"...markdown...\", \"dependencies\": [\"...\"]}",
                ),
                ChatMessage::user(format!(
                    "## TASK\n{}\n\n## ANALYSIS\n{analysis}",
                    card.task_text()
                )),
            ],
            model: services.llm_model.clone(),
            temperature: 0.2,
            max_tokens: services.llm_max_tokens,
        };
        let hash = prompt_hash(&request);

        let completion = services
            .gateway
            .complete(&request, self.name().as_str(), "architecture_decision")
            .await
            .map_err(StageFailure::from)?;

        let envelope: AdrEnvelope = serde_json::from_str(completion.content.trim())
            .map_err(|e| StageFailure::contract(format!("unparseable ADR envelope: {e}")))?;

        std::fs::create_dir_all(&services.work_dir)
            .map_err(|e| StageFailure::fatal(format!("cannot create work dir: {e}")))?;
        let adr_path = services.work_dir.join("adr.md");
        std::fs::write(&adr_path, &envelope.adr)
            .map_err(|e| StageFailure::fatal(format!("cannot write ADR: {e}")))?;

        let adr_str = adr_path.display().to_string();
        Ok(StageOutput::new(json!({
            "adr_file": adr_str,
            "dependencies_identified": envelope.dependencies,
        }))
        .with_context_update(keys::ADR_FILE, Value::String(adr_str.clone()))
        .with_context_update(keys::DEPENDENCIES_IDENTIFIED, json!(envelope.dependencies))
        .with_artifact(adr_str)
        .with_llm_exchange(LlmExchange {
            prompt_hash: hash,
            prompt: request
                .messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            response: completion.content,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_requires_analysis_report() {
        let stage = ArchitectureStage;
        let ctx = Context::new();
        let err = stage.setup(&Card::new("c-1", "t"), &ctx).unwrap_err();
        assert!(err.message.contains(keys::ANALYSIS_REPORT));

        let mut ready = Context::new();
        ready
            .insert(keys::ANALYSIS_REPORT, json!("/tmp/report.md"), "analysis")
            .unwrap();
        assert!(stage.setup(&Card::new("c-1", "t"), &ready).is_ok());
    }

    #[test]
    fn test_envelope_parsing() {
        let raw = r##"{"adr": "# ADR-001\nUse rotation.", "dependencies": ["jwt", "redis"]}"##;
        let envelope: AdrEnvelope = serde_json::from_str(raw).unwrap();
        assert!(envelope.adr.starts_with("# ADR-001"));
        assert_eq!(envelope.dependencies, vec!["jwt", "redis"]);
    }

    #[test]
    fn test_envelope_dependencies_default_empty() {
        let raw = r#"{"adr": "minimal"}"#;
        let envelope: AdrEnvelope = serde_json::from_str(raw).unwrap();
        assert!(envelope.dependencies.is_empty());
    }
}
