//! Checkpoint persistence and the resume state machine.
//!
//! Every mutation rewrites the full checkpoint atomically (temp file + fsync
//! + rename), so a crash mid-write yields either the pre- or post-state,
//! never a torn one.

use super::{Checkpoint, CheckpointStatus, LlmExchange, Progress, StageRecord, StageStatus};
use crate::errors::CheckpointError;
use crate::stage::StageName;
use anyhow::Context;
use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

pub struct CheckpointManager {
    dir: PathBuf,
    current: Mutex<Option<Checkpoint>>,
}

impl CheckpointManager {
    pub fn new(dir: &Path) -> Result<Self, CheckpointError> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create checkpoint dir: {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            current: Mutex::new(None),
        })
    }

    pub fn checkpoint_path(&self, card_id: &str) -> PathBuf {
        self.dir.join(format!("{card_id}.json"))
    }

    pub fn exists(&self, card_id: &str) -> bool {
        self.checkpoint_path(card_id).exists()
    }

    /// Initialize a fresh checkpoint with `status=active` and persist it.
    pub fn create(
        &self,
        card_id: &str,
        total_stages: usize,
        execution_context: Value,
    ) -> Result<Checkpoint, CheckpointError> {
        let now = Utc::now();
        let checkpoint = Checkpoint {
            checkpoint_id: Uuid::new_v4().to_string(),
            card_id: card_id.to_string(),
            status: CheckpointStatus::Active,
            created_at: now,
            updated_at: now,
            completed_stages: Vec::new(),
            failed_stages: Vec::new(),
            skipped_stages: Vec::new(),
            current_stage: None,
            stage_checkpoints: Default::default(),
            total_stages,
            stages_completed: 0,
            resume_count: 0,
            last_resume_time: None,
            failure_reason: None,
            execution_context,
        };
        self.persist(&checkpoint)?;
        *self.current.lock().expect("checkpoint lock poisoned") = Some(checkpoint.clone());
        Ok(checkpoint)
    }

    /// Load a checkpoint from disk without adopting it as current.
    pub fn load(&self, card_id: &str) -> Result<Checkpoint, CheckpointError> {
        let path = self.checkpoint_path(card_id);
        if !path.exists() {
            return Err(CheckpointError::NotFound {
                card_id: card_id.to_string(),
            });
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checkpoint: {}", path.display()))?;
        Ok(checkpoint)
    }

    /// A run can resume iff a checkpoint exists in a resumable status with at
    /// least one unsettled stage.
    pub fn can_resume(&self, card_id: &str) -> bool {
        match self.load(card_id) {
            Ok(cp) => {
                matches!(
                    cp.status,
                    CheckpointStatus::Active | CheckpointStatus::Paused | CheckpointStatus::Failed
                ) && cp.has_remaining_stages()
            }
            Err(_) => false,
        }
    }

    /// Reload the checkpoint, bump `resume_count`, and adopt it as current.
    /// Resuming a failed run is the one sanctioned transition out of a
    /// terminal status.
    pub fn resume(&self, card_id: &str) -> Result<Checkpoint, CheckpointError> {
        let mut checkpoint = self.load(card_id)?;
        if checkpoint.status == CheckpointStatus::Completed {
            return Err(CheckpointError::Terminal {
                card_id: card_id.to_string(),
                status: checkpoint.status.as_str().to_string(),
            });
        }
        checkpoint.resume_count += 1;
        checkpoint.last_resume_time = Some(Utc::now());
        checkpoint.status = CheckpointStatus::Active;
        checkpoint.failure_reason = None;
        checkpoint.updated_at = Utc::now();
        self.persist(&checkpoint)?;
        *self.current.lock().expect("checkpoint lock poisoned") = Some(checkpoint.clone());
        Ok(checkpoint)
    }

    /// Snapshot of the current in-memory checkpoint.
    pub fn current(&self) -> Option<Checkpoint> {
        self.current.lock().expect("checkpoint lock poisoned").clone()
    }

    pub fn set_current_stage(&self, stage: StageName) -> Result<(), CheckpointError> {
        self.mutate(|cp| {
            cp.current_stage = Some(stage);
            Ok(())
        })
    }

    /// Append or update a stage record. Completed records are added to
    /// `completed_stages`, failed to `failed_stages`, skipped to
    /// `skipped_stages`; the terminal lists stay pairwise disjoint.
    pub fn save_stage(&self, record: StageRecord) -> Result<(), CheckpointError> {
        self.mutate(|cp| {
            let stage = record.stage_name;
            cp.completed_stages.retain(|s| *s != stage);
            cp.failed_stages.retain(|s| *s != stage);
            cp.skipped_stages.retain(|s| *s != stage);
            match record.status {
                StageStatus::Completed => cp.completed_stages.push(stage),
                StageStatus::Failed => cp.failed_stages.push(stage),
                StageStatus::Skipped => cp.skipped_stages.push(stage),
                StageStatus::Pending | StageStatus::Running => {}
            }
            cp.stage_checkpoints
                .insert(stage.as_str().to_string(), record);
            cp.stages_completed = cp.completed_stages.len();
            Ok(())
        })
    }

    /// First stage in `all_stages` that has not completed or been skipped.
    pub fn next_stage(&self, all_stages: &[StageName]) -> Option<StageName> {
        let guard = self.current.lock().expect("checkpoint lock poisoned");
        let cp = guard.as_ref()?;
        all_stages
            .iter()
            .copied()
            .find(|s| !cp.completed_stages.contains(s) && !cp.skipped_stages.contains(s))
    }

    /// Replay a stage's cached LLM exchange by prompt hash, if present.
    pub fn cached_llm_response(&self, stage: StageName, prompt_hash: &str) -> Option<LlmExchange> {
        let guard = self.current.lock().expect("checkpoint lock poisoned");
        let cp = guard.as_ref()?;
        cp.stage_checkpoints
            .get(stage.as_str())?
            .llm_responses
            .iter()
            .find(|x| x.prompt_hash == prompt_hash)
            .cloned()
    }

    /// Persist the orchestrator's context snapshot so a resumed run can
    /// rebuild the keys committed by completed stages.
    pub fn set_execution_context(&self, context: Value) -> Result<(), CheckpointError> {
        self.mutate(|cp| {
            cp.execution_context = context;
            Ok(())
        })
    }

    pub fn mark_completed(&self) -> Result<(), CheckpointError> {
        self.mutate(|cp| {
            cp.status = CheckpointStatus::Completed;
            cp.current_stage = None;
            Ok(())
        })
    }

    pub fn mark_failed(&self, reason: &str) -> Result<(), CheckpointError> {
        self.mutate(|cp| {
            cp.status = CheckpointStatus::Failed;
            cp.failure_reason = Some(reason.to_string());
            Ok(())
        })
    }

    pub fn pause(&self) -> Result<(), CheckpointError> {
        self.mutate(|cp| {
            cp.status = CheckpointStatus::Paused;
            Ok(())
        })
    }

    /// Progress view with a naive ETA: average completed-stage duration times
    /// the number of remaining stages.
    pub fn progress(&self) -> Option<Progress> {
        let guard = self.current.lock().expect("checkpoint lock poisoned");
        let cp = guard.as_ref()?;

        let completed_durations: Vec<f64> = cp
            .completed_stages
            .iter()
            .filter_map(|s| cp.stage_checkpoints.get(s.as_str()))
            .map(|r| r.duration_seconds)
            .collect();

        let settled = cp.settled_stages().len();
        let remaining = cp.total_stages.saturating_sub(settled);
        let estimated_remaining_seconds = if completed_durations.is_empty() || remaining == 0 {
            None
        } else {
            let avg = completed_durations.iter().sum::<f64>() / completed_durations.len() as f64;
            Some(avg * remaining as f64)
        };

        Some(Progress {
            progress_percent: if cp.total_stages == 0 {
                100.0
            } else {
                settled as f64 * 100.0 / cp.total_stages as f64
            },
            stages_completed: cp.stages_completed,
            total_stages: cp.total_stages,
            current_stage: cp.current_stage,
            elapsed_seconds: (Utc::now() - cp.created_at).num_milliseconds() as f64 / 1000.0,
            estimated_remaining_seconds,
        })
    }

    // ── Internals ───────────────────────────────────────────────────

    fn mutate(
        &self,
        f: impl FnOnce(&mut Checkpoint) -> Result<(), CheckpointError>,
    ) -> Result<(), CheckpointError> {
        let mut guard = self.current.lock().expect("checkpoint lock poisoned");
        let cp = guard.as_mut().ok_or_else(|| {
            CheckpointError::Other(anyhow::anyhow!("no checkpoint is currently loaded"))
        })?;
        if cp.status.is_terminal() {
            return Err(CheckpointError::Terminal {
                card_id: cp.card_id.clone(),
                status: cp.status.as_str().to_string(),
            });
        }
        f(cp)?;
        cp.updated_at = Utc::now();
        self.persist(cp)
    }

    /// Full-file atomic write: temp file in the same directory, fsync, rename.
    fn persist(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.checkpoint_path(&checkpoint.card_id);
        let tmp = path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(checkpoint)
            .context("Failed to serialize checkpoint")?;
        let write = || -> std::io::Result<()> {
            use std::io::Write;
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|source| CheckpointError::WriteFailed {
            path: path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> CheckpointManager {
        CheckpointManager::new(dir).unwrap()
    }

    fn completed_record(stage: StageName, duration: f64) -> StageRecord {
        let start = Utc::now();
        StageRecord {
            stage_name: stage,
            status: StageStatus::Completed,
            start_time: start,
            end_time: Some(start + chrono::Duration::seconds(duration as i64)),
            duration_seconds: duration,
            result: Some(json!({"ok": true})),
            artifacts: Vec::new(),
            llm_responses: Vec::new(),
            error_message: None,
            retry_count: 0,
            skip_reason: None,
        }
    }

    const PLAN: &[StageName] = &[
        StageName::Analysis,
        StageName::Architecture,
        StageName::Dependencies,
        StageName::Development,
    ];

    #[test]
    fn test_create_persists_active_checkpoint() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());

        let cp = mgr.create("c-1", 4, json!({})).unwrap();
        assert_eq!(cp.status, CheckpointStatus::Active);
        assert!(mgr.exists("c-1"));

        let loaded = mgr.load("c-1").unwrap();
        assert_eq!(loaded.checkpoint_id, cp.checkpoint_id);
        assert_eq!(loaded.total_stages, 4);
    }

    #[test]
    fn test_save_stage_maintains_disjoint_lists() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.create("c-1", 4, json!({})).unwrap();

        mgr.save_stage(completed_record(StageName::Analysis, 1.0))
            .unwrap();

        let mut failed = completed_record(StageName::Architecture, 2.0);
        failed.status = StageStatus::Failed;
        failed.error_message = Some("boom".to_string());
        mgr.save_stage(failed).unwrap();

        let cp = mgr.current().unwrap();
        assert_eq!(cp.completed_stages, vec![StageName::Analysis]);
        assert_eq!(cp.failed_stages, vec![StageName::Architecture]);
        assert!(cp.skipped_stages.is_empty());
        assert_eq!(cp.stages_completed, 1);

        // Re-saving the failed stage as completed moves it between lists.
        mgr.save_stage(completed_record(StageName::Architecture, 2.0))
            .unwrap();
        let cp = mgr.current().unwrap();
        assert_eq!(cp.failed_stages.len(), 0);
        assert_eq!(cp.completed_stages.len(), 2);
        assert_eq!(cp.stages_completed, 2);
    }

    #[test]
    fn test_next_stage_skips_settled() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.create("c-1", 4, json!({})).unwrap();

        assert_eq!(mgr.next_stage(PLAN), Some(StageName::Analysis));
        mgr.save_stage(completed_record(StageName::Analysis, 1.0))
            .unwrap();
        assert_eq!(mgr.next_stage(PLAN), Some(StageName::Architecture));

        let mut skipped = completed_record(StageName::Architecture, 0.0);
        skipped.status = StageStatus::Skipped;
        skipped.skip_reason = Some("circuit_breaker_open".to_string());
        mgr.save_stage(skipped).unwrap();
        assert_eq!(mgr.next_stage(PLAN), Some(StageName::Dependencies));
    }

    #[test]
    fn test_crash_then_resume_preserves_committed_state() {
        let dir = tempdir().unwrap();
        {
            let mgr = manager(dir.path());
            mgr.create("c-2", 4, json!({})).unwrap();
            mgr.save_stage(completed_record(StageName::Analysis, 1.0))
                .unwrap();
            let mut record = completed_record(StageName::Architecture, 3.0);
            record.llm_responses.push(LlmExchange {
                prompt_hash: "hash-1".to_string(),
                prompt: "design it".to_string(),
                response: "the design".to_string(),
            });
            mgr.save_stage(record).unwrap();
            // Manager dropped here: simulated process death.
        }

        let mgr = manager(dir.path());
        assert!(mgr.can_resume("c-2"));
        let cp = mgr.resume("c-2").unwrap();
        assert_eq!(cp.resume_count, 1);
        assert!(cp.last_resume_time.is_some());
        assert_eq!(mgr.next_stage(PLAN), Some(StageName::Dependencies));

        let cached = mgr
            .cached_llm_response(StageName::Architecture, "hash-1")
            .unwrap();
        assert_eq!(cached.response, "the design");
        assert!(
            mgr.cached_llm_response(StageName::Architecture, "other")
                .is_none()
        );
    }

    #[test]
    fn test_terminal_checkpoint_rejects_mutation() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.create("c-3", 1, json!({})).unwrap();
        mgr.mark_completed().unwrap();

        let err = mgr
            .save_stage(completed_record(StageName::Analysis, 1.0))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Terminal { .. }));
        assert!(!mgr.can_resume("c-3"));
    }

    #[test]
    fn test_failed_run_can_resume() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.create("c-4", 2, json!({})).unwrap();
        mgr.mark_failed("network down").unwrap();

        assert!(mgr.can_resume("c-4"));
        let cp = mgr.resume("c-4").unwrap();
        assert_eq!(cp.status, CheckpointStatus::Active);
        assert!(cp.failure_reason.is_none());
    }

    #[test]
    fn test_fully_settled_run_cannot_resume() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.create("c-5", 1, json!({})).unwrap();
        mgr.save_stage(completed_record(StageName::Analysis, 1.0))
            .unwrap();
        // Active status but nothing left to do.
        assert!(!mgr.can_resume("c-5"));
    }

    #[test]
    fn test_progress_reports_percent_and_eta() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.create("c-6", 4, json!({})).unwrap();
        mgr.set_current_stage(StageName::Architecture).unwrap();
        mgr.save_stage(completed_record(StageName::Analysis, 10.0))
            .unwrap();

        let progress = mgr.progress().unwrap();
        assert_eq!(progress.stages_completed, 1);
        assert_eq!(progress.total_stages, 4);
        assert!((progress.progress_percent - 25.0).abs() < 1e-9);
        assert_eq!(progress.current_stage, Some(StageName::Architecture));
        // One completed stage at 10s, three remaining.
        assert!((progress.estimated_remaining_seconds.unwrap() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_torn_write_artifacts_left_behind() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.create("c-7", 2, json!({})).unwrap();
        mgr.save_stage(completed_record(StageName::Analysis, 1.0))
            .unwrap();

        let tmp = mgr.checkpoint_path("c-7").with_extension("json.tmp");
        assert!(!tmp.exists(), "temp file must be renamed away");
    }
}
