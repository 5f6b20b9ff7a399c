//! Project analysis stage.
//!
//! Consumes the card, produces an analysis report and the list of approved
//! changes. When external approval is configured, the stage announces the
//! request on the bus and polls the card's shared state until an approver
//! sets `analysis_approved` (or the window closes).

use super::{Stage, StageName, StageOutput, StageServices};
use crate::bus::{MessageEnvelope, MessagePriority, MessageType};
use crate::card::Card;
use crate::checkpoint::LlmExchange;
use crate::context::{Context, keys};
use crate::errors::StageFailure;
use crate::llm::{ChatMessage, CompletionRequest, prompt_hash};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

const APPROVAL_POLL_INTERVAL_SECS: u64 = 2;

pub struct AnalysisStage;

#[async_trait]
impl Stage for AnalysisStage {
    fn name(&self) -> StageName {
        StageName::Analysis
    }

    async fn execute_stage(
        &self,
        card: &Card,
        ctx: &Context,
        services: &StageServices,
        token: &CancellationToken,
    ) -> Result<StageOutput, StageFailure> {
        let insights = ctx
            .get(keys::RAG_INSIGHTS)
            .map(|v| format!("\n## INSIGHTS FROM PAST RUNS\n{v}"))
            .unwrap_or_default();

        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(
                    "You are the project analysis agent of an autonomous pipeline. \
                     Assess the task, list risks, and enumerate the concrete changes \
                     the pipeline should make.",
                ),
                ChatMessage::user(format!(
                    "## CARD\nid: {}\ntitle: {}\npriority: {}\nstory points: {}\n\n\
                     ## DESCRIPTION\n{}\n\n## ACCEPTANCE CRITERIA\n{}{}",
                    card.card_id,
                    card.title,
                    card.priority,
                    card.story_points,
                    card.description,
                    card.acceptance_criteria.join("\n"),
                    insights,
                )),
            ],
            model: services.llm_model.clone(),
            temperature: 0.2,
            max_tokens: services.llm_max_tokens,
        };
        let hash = prompt_hash(&request);

        let completion = services
            .gateway
            .complete(&request, self.name().as_str(), "analysis_report")
            .await
            .map_err(StageFailure::from)?;

        std::fs::create_dir_all(&services.work_dir)
            .map_err(|e| StageFailure::fatal(format!("cannot create work dir: {e}")))?;
        let report_path = services.work_dir.join("analysis_report.md");
        std::fs::write(&report_path, &completion.content)
            .map_err(|e| StageFailure::fatal(format!("cannot write analysis report: {e}")))?;

        // The report may carry a structured approved-changes list; otherwise
        // the acceptance criteria stand in.
        let approved_changes = parse_approved_changes(&completion.content)
            .unwrap_or_else(|| fallback_changes(card));

        let approval = if services.approval_required {
            self.await_approval(card, services, token).await?
        } else {
            "auto".to_string()
        };

        let report_str = report_path.display().to_string();
        Ok(StageOutput::new(json!({
            "report_path": report_str,
            "approved_changes": approved_changes,
            "approval": approval,
        }))
        .with_context_update(keys::ANALYSIS_REPORT, Value::String(report_str.clone()))
        .with_context_update(keys::APPROVED_CHANGES, json!(approved_changes))
        .with_artifact(report_str)
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

impl AnalysisStage {
    /// Announce the approval request, then poll shared state for the
    /// `analysis_approved` flag until it appears or the window closes.
    async fn await_approval(
        &self,
        card: &Card,
        services: &StageServices,
        token: &CancellationToken,
    ) -> Result<String, StageFailure> {
        let request = MessageEnvelope::new(
            super::ENGINE_AGENT,
            crate::bus::BROADCAST,
            MessageType::Request,
            &card.card_id,
        )
        .with_priority(MessagePriority::High)
        .with_data("type", json!("analysis_approval_requested"))
        .with_data("card_title", json!(card.title));
        services
            .bus
            .send(&request)
            .map_err(|e| StageFailure::fatal(format!("bus send failed: {e}")))?;

        let deadline =
            std::time::Instant::now() + std::time::Duration::from_secs(services.approval_timeout_secs);
        loop {
            let state = services
                .bus
                .get_shared_state(&card.card_id)
                .map_err(|e| StageFailure::fatal(format!("shared state read failed: {e}")))?;
            if state
                .shared_data
                .get("analysis_approved")
                .and_then(Value::as_bool)
                == Some(true)
            {
                return Ok("granted".to_string());
            }
            if std::time::Instant::now() >= deadline {
                return Err(StageFailure::fatal(
                    "analysis approval not granted within the approval window",
                ));
            }
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(APPROVAL_POLL_INTERVAL_SECS)) => {}
                _ = token.cancelled() => {
                    return Err(StageFailure::transient("analysis approval wait cancelled"));
                }
            }
        }
    }
}

/// Pull `approved_changes` out of a structured report, if the agent returned
/// one.
fn parse_approved_changes(content: &str) -> Option<Vec<String>> {
    let value: Value = serde_json::from_str(content.trim()).ok()?;
    let changes = value.get("approved_changes")?.as_array()?;
    Some(
        changes
            .iter()
            .filter_map(|c| c.as_str().map(str::to_string))
            .collect(),
    )
}

fn fallback_changes(card: &Card) -> Vec<String> {
    if card.acceptance_criteria.is_empty() {
        vec![card.title.clone()]
    } else {
        card.acceptance_criteria.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_structured_approved_changes() {
        let content = r#"{"summary": "ok", "approved_changes": ["rotate tokens", "add tests"]}"#;
        let changes = parse_approved_changes(content).unwrap();
        assert_eq!(changes, vec!["rotate tokens", "add tests"]);
    }

    #[test]
    fn test_freeform_report_falls_back_to_criteria() {
        assert!(parse_approved_changes("# Report\nJust prose.").is_none());

        let card = Card::new("c-1", "Fix typo")
            .with_acceptance_criteria(["spelling corrected"]);
        assert_eq!(fallback_changes(&card), vec!["spelling corrected"]);

        let bare = Card::new("c-2", "Do the thing");
        assert_eq!(fallback_changes(&bare), vec!["Do the thing"]);
    }
}
