//! Durable per-card execution snapshots.
//!
//! A [`Checkpoint`] records which stages completed, failed, or were skipped,
//! the per-stage results, and the LLM exchanges each stage made: enough to
//! resume a crashed run without re-executing committed work.

mod manager;

pub use manager::CheckpointManager;

use crate::stage::StageName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

/// One prompt/response pair a stage made through the gateway, kept so a
/// resumed run can replay the exchange byte-identically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmExchange {
    pub prompt_hash: String,
    pub prompt: String,
    pub response: String,
}

/// Execution record for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage_name: StageName,
    pub status: StageStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub llm_responses: Vec<LlmExchange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Present on skipped records (e.g. `circuit_breaker_open`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl StageRecord {
    pub fn started(stage_name: StageName) -> Self {
        Self {
            stage_name,
            status: StageStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            duration_seconds: 0.0,
            result: None,
            artifacts: Vec::new(),
            llm_responses: Vec::new(),
            error_message: None,
            retry_count: 0,
            skip_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Active,
    Paused,
    Completed,
    Failed,
    Resumed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Active => "active",
            CheckpointStatus::Paused => "paused",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
            CheckpointStatus::Resumed => "resumed",
        }
    }

    /// Completed and failed checkpoints reject further mutation (resume from
    /// a failed run being the one sanctioned exception).
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckpointStatus::Completed | CheckpointStatus::Failed)
    }
}

/// The durable record of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub card_id: String,
    pub status: CheckpointStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_stages: Vec<StageName>,
    #[serde(default)]
    pub failed_stages: Vec<StageName>,
    #[serde(default)]
    pub skipped_stages: Vec<StageName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<StageName>,
    #[serde(default)]
    pub stage_checkpoints: BTreeMap<String, StageRecord>,
    pub total_stages: usize,
    #[serde(default)]
    pub stages_completed: usize,
    #[serde(default)]
    pub resume_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resume_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Orchestrator context snapshot taken at creation.
    #[serde(default)]
    pub execution_context: Value,
}

impl Checkpoint {
    /// Stages with any terminal record (completed, failed, or skipped).
    pub fn settled_stages(&self) -> Vec<StageName> {
        let mut all = self.completed_stages.clone();
        all.extend(&self.failed_stages);
        all.extend(&self.skipped_stages);
        all
    }

    /// Whether any planned stage has not yet settled.
    pub fn has_remaining_stages(&self) -> bool {
        self.settled_stages().len() < self.total_stages
    }
}

/// Point-in-time progress view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub progress_percent: f64,
    pub stages_completed: usize,
    pub total_stages: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<StageName>,
    pub elapsed_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_seconds: Option<f64>,
}
