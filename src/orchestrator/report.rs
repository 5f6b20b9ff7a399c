//! The final run report: terminal status, per-stage outcomes, cost, and
//! pointers to everything durable. Nothing is hidden on failure.

use crate::checkpoint::{Checkpoint, StageStatus};
use crate::supervisor::SupervisorStatistics;
use anyhow::{Context as _, Result};
use console::style;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One stage line in the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: String,
    pub status: String,
    pub duration_seconds: f64,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub card_id: String,
    pub card_title: String,
    /// `completed` or `failed`.
    pub terminal_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Stage → fallback label, for every fallback that was applied.
    #[serde(default)]
    pub fallbacks_applied: Vec<(String, String)>,
    pub stages: Vec<StageSummary>,
    pub total_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub production_ready: Option<bool>,
    pub artifact_ids: Vec<String>,
    pub checkpoint_path: String,
    pub resume_count: u32,
    pub supervisor: SupervisorStatistics,
}

impl RunReport {
    pub fn completed(&self) -> bool {
        self.terminal_status == "completed"
    }

    /// Assemble the stage table from a checkpoint, in settled order.
    pub fn stage_summaries(checkpoint: &Checkpoint) -> Vec<StageSummary> {
        let mut summaries: Vec<StageSummary> = checkpoint
            .stage_checkpoints
            .values()
            .map(|record| StageSummary {
                stage: record.stage_name.as_str().to_string(),
                status: record.status.as_str().to_string(),
                duration_seconds: record.duration_seconds,
                retry_count: record.retry_count,
                skip_reason: record.skip_reason.clone(),
                error: record.error_message.clone(),
            })
            .collect();
        summaries.sort_by_key(|s| {
            checkpoint
                .stage_checkpoints
                .get(&s.stage)
                .map(|r| r.start_time)
        });
        summaries
    }

    /// Every artifact id recorded across stage records.
    pub fn collect_artifacts(checkpoint: &Checkpoint) -> Vec<String> {
        checkpoint
            .stage_checkpoints
            .values()
            .filter(|r| r.status == StageStatus::Completed)
            .flat_map(|r| r.artifacts.iter().cloned())
            .collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write run report: {}", path.display()))?;
        Ok(())
    }

    /// Human-readable rendering for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let status = if self.completed() {
            style("completed").green().bold().to_string()
        } else {
            style("failed").red().bold().to_string()
        };
        out.push_str(&format!(
            "\n{} [{}] {} -> {status}\n",
            style("pipeline").bold(),
            self.card_id,
            self.card_title
        ));

        for stage in &self.stages {
            let mark = match stage.status.as_str() {
                "completed" => style("ok").green().to_string(),
                "skipped" => style("skip").yellow().to_string(),
                _ => style("fail").red().to_string(),
            };
            out.push_str(&format!(
                "  {:<14} {:<5} {:>7.2}s retries={}{}\n",
                stage.stage,
                mark,
                stage.duration_seconds,
                stage.retry_count,
                stage
                    .skip_reason
                    .as_ref()
                    .map(|r| format!(" ({r})"))
                    .unwrap_or_default(),
            ));
        }

        if let Some(stage) = &self.failed_stage {
            out.push_str(&format!(
                "  failed stage: {stage} ({})\n  error: {}\n",
                self.error_kind.as_deref().unwrap_or("unknown"),
                self.error_message.as_deref().unwrap_or("unknown"),
            ));
        }
        for (stage, label) in &self.fallbacks_applied {
            out.push_str(&format!("  fallback applied in {stage}: {label}\n"));
        }
        if let Some(ready) = self.production_ready {
            out.push_str(&format!("  production ready: {ready}\n"));
        }
        out.push_str(&format!(
            "  total cost: ${:.4} | llm calls: {} ({} cached) | resumes: {}\n",
            self.total_cost, self.supervisor.llm.calls, self.supervisor.llm.cached_calls,
            self.resume_count
        ));
        out.push_str(&format!("  checkpoint: {}\n", self.checkpoint_path));
        out.push_str(&format!("  artifacts: {}\n", self.artifact_ids.len()));
        out
    }
}
