//! Unexpected-state recovery with institutional memory.
//!
//! When a stage observes a state outside its expected set, the handler first
//! looks for a previously learned `unexpected_state_solution` artifact close
//! to the situation. Failing that, and when learning is enabled, it asks the
//! gateway to synthesize a recovery workflow, dry-runs any embedded code in
//! the sandbox, and stores the successful result for the next run.

use crate::errors::StageFailure;
use crate::llm::{ChatMessage, CompletionRequest, LlmGateway};
use crate::rag::{ArtifactStore, ArtifactType};
use crate::sandbox::{Language, SandboxExecutor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Similarity at or above which a stored solution is applied as-is.
const REUSE_THRESHOLD: f32 = 0.35;

/// The captured situation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnexpectedState {
    pub card_id: String,
    pub stage: String,
    pub current_state: String,
    pub expected_states: Vec<String>,
    #[serde(default)]
    pub context: Value,
}

impl UnexpectedState {
    fn query_text(&self) -> String {
        format!(
            "{} entered state {} expecting one of {}",
            self.stage,
            self.current_state,
            self.expected_states.join(", ")
        )
    }
}

/// How the situation was resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "resolution")]
pub enum Resolution {
    /// A stored solution was close enough to apply.
    Reused { artifact_id: String, workflow: String },
    /// A new workflow was synthesized, verified, and stored.
    Learned { artifact_id: String, workflow: String },
    /// No stored solution and learning unavailable or unsuccessful.
    Unresolved,
}

pub struct UnexpectedStateHandler {
    artifacts: Arc<ArtifactStore>,
    sandbox: Arc<SandboxExecutor>,
}

impl UnexpectedStateHandler {
    pub fn new(artifacts: Arc<ArtifactStore>, sandbox: Arc<SandboxExecutor>) -> Self {
        Self { artifacts, sandbox }
    }

    pub async fn handle(
        &self,
        state: &UnexpectedState,
        gateway: Option<&LlmGateway>,
        model: &str,
        auto_learn: bool,
        token: &CancellationToken,
    ) -> Result<Resolution, StageFailure> {
        tracing::warn!(
            stage = %state.stage,
            current = %state.current_state,
            expected = ?state.expected_states,
            "unexpected state captured"
        );

        // Prior art first.
        let hits = self.artifacts.query_similar(
            &state.query_text(),
            Some(&[ArtifactType::UnexpectedStateSolution]),
            1,
            None,
        );
        if let Some(hit) = hits.first()
            && hit.similarity >= REUSE_THRESHOLD
        {
            tracing::info!(
                artifact_id = %hit.artifact.artifact_id,
                similarity = hit.similarity,
                "reusing stored recovery workflow"
            );
            return Ok(Resolution::Reused {
                artifact_id: hit.artifact.artifact_id.clone(),
                workflow: hit.artifact.content.clone(),
            });
        }

        let (Some(gateway), true) = (gateway, auto_learn) else {
            return Ok(Resolution::Unresolved);
        };

        // Synthesize a recovery workflow.
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(
                    "You are a recovery planner for an autonomous pipeline. Given an \
                     unexpected state, produce a short numbered recovery workflow. If a \
                     verification snippet helps, include one fenced python block.",
                ),
                ChatMessage::user(format!(
                    "Stage '{}' for card '{}' reached state '{}' but expected one of: {}.\n\
                     Context: {}\nProduce the recovery workflow.",
                    state.stage,
                    state.card_id,
                    state.current_state,
                    state.expected_states.join(", "),
                    state.context,
                )),
            ],
            model: model.to_string(),
            temperature: 0.2,
            max_tokens: 1024,
        };

        let completion = gateway
            .complete(&request, &state.stage, "unexpected_state_recovery")
            .await
            .map_err(StageFailure::from)?;
        let workflow = completion.content;

        // Verify embedded code before trusting the workflow.
        if let Some(snippet) = extract_python_block(&workflow) {
            let run = self
                .sandbox
                .execute(&snippet, Language::Python, None, true, token)
                .await
                .map_err(|e| StageFailure::sandbox(format!("recovery snippet failed: {e}")))?;
            if !run.success {
                tracing::warn!(
                    stage = %state.stage,
                    exit_code = run.exit_code,
                    "synthesized recovery snippet failed verification"
                );
                return Ok(Resolution::Unresolved);
            }
        }

        let mut metadata = Map::new();
        metadata.insert("stage".to_string(), json!(state.stage));
        metadata.insert("current_state".to_string(), json!(state.current_state));
        metadata.insert(
            "expected_states".to_string(),
            json!(state.expected_states),
        );
        let artifact_id = self
            .artifacts
            .store(
                ArtifactType::UnexpectedStateSolution,
                &state.card_id,
                &state.query_text(),
                &workflow,
                metadata,
            )
            .map_err(|e| StageFailure::fatal(format!("failed to store learned solution: {e}")))?;

        Ok(Resolution::Learned {
            artifact_id,
            workflow,
        })
    }
}

fn extract_python_block(text: &str) -> Option<String> {
    let start = text.find("```python")?;
    let rest = &text[start + "```python".len()..];
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest.find("```")?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ResponseCache, ScriptedProvider};
    use crate::supervisor::budget::{BudgetConfig, CostTracker};
    use tempfile::tempdir;

    fn state() -> UnexpectedState {
        UnexpectedState {
            card_id: "c-1".to_string(),
            stage: "integration".to_string(),
            current_state: "conflict".to_string(),
            expected_states: vec!["clean".to_string(), "applied".to_string()],
            context: json!({"files": 3}),
        }
    }

    fn handler(dir: &std::path::Path) -> UnexpectedStateHandler {
        UnexpectedStateHandler::new(
            Arc::new(ArtifactStore::open_default(dir).unwrap()),
            Arc::new(SandboxExecutor::with_defaults()),
        )
    }

    fn gateway(dir: &std::path::Path, response: &str) -> LlmGateway {
        LlmGateway::new(
            Box::new(ScriptedProvider::new().with_default(response)),
            ResponseCache::with_default_ttl(&dir.join("cache")).unwrap(),
            Arc::new(CostTracker::new(BudgetConfig::default())),
        )
    }

    #[tokio::test]
    async fn test_unresolved_without_learning() {
        let dir = tempdir().unwrap();
        let handler = handler(dir.path());
        let resolution = handler
            .handle(&state(), None, "m", true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::Unresolved));
    }

    #[tokio::test]
    async fn test_learning_stores_solution() {
        let dir = tempdir().unwrap();
        let handler = handler(dir.path());
        let gw = gateway(
            dir.path(),
            "1. Re-apply the winner files.\n2. Re-run the suite.\n```python\nprint('verified')\n```",
        );

        let resolution = handler
            .handle(&state(), Some(&gw), "m", true, &CancellationToken::new())
            .await
            .unwrap();
        let Resolution::Learned { artifact_id, workflow } = resolution else {
            panic!("expected a learned resolution");
        };
        assert!(workflow.contains("Re-apply"));
        assert!(handler.artifacts.get(&artifact_id).is_some());
    }

    #[tokio::test]
    async fn test_second_occurrence_reuses_stored_solution() {
        let dir = tempdir().unwrap();
        let handler = handler(dir.path());
        let gw = gateway(dir.path(), "1. Roll back and retry the stage.");

        let first = handler
            .handle(&state(), Some(&gw), "m", true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(first, Resolution::Learned { .. }));

        // Same situation again: no gateway needed this time.
        let second = handler
            .handle(&state(), None, "m", false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(second, Resolution::Reused { .. }));
    }

    #[tokio::test]
    async fn test_failing_verification_snippet_stores_nothing() {
        let dir = tempdir().unwrap();
        let handler = handler(dir.path());
        let gw = gateway(
            dir.path(),
            "1. Try this.\n```python\nimport sys\nsys.exit(1)\n```",
        );

        let resolution = handler
            .handle(&state(), Some(&gw), "m", true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::Unresolved));
        assert_eq!(handler.artifacts.len(), 0);
    }

    #[test]
    fn test_extract_python_block() {
        let text = "plan\n```python\nprint('x')\n```\nafter";
        assert_eq!(extract_python_block(text).unwrap(), "print('x')\n");
        assert!(extract_python_block("no code here").is_none());
    }
}
