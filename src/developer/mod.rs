//! Parallel developer fan-out: competing workers, their artifacts, and the
//! arbitration that picks a winner.

mod arbitration;
mod invoker;

pub use arbitration::{CandidateScore, ScoreBreakdown, score_candidates, select_winner};
pub use invoker::{DeveloperInvoker, combine_files, detect_language};

use serde::{Deserialize, Serialize};

/// Behavioral profile assigned to a worker. Profiles differentiate the
/// competing attempts; assignment is deterministic by worker id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerProfile {
    Conservative,
    Balanced,
    Aggressive,
}

impl WorkerProfile {
    /// Deterministic assignment: worker 1 is conservative, worker 2
    /// aggressive, worker 3 balanced, then the cycle repeats.
    pub fn for_worker(worker_id: u32) -> Self {
        match worker_id % 3 {
            1 => WorkerProfile::Conservative,
            2 => WorkerProfile::Aggressive,
            _ => WorkerProfile::Balanced,
        }
    }

    pub fn coverage_target(&self) -> f64 {
        match self {
            WorkerProfile::Conservative => 0.80,
            WorkerProfile::Balanced => 0.85,
            WorkerProfile::Aggressive => 0.90,
        }
    }

    pub fn temperature(&self) -> f64 {
        match self {
            WorkerProfile::Conservative => 0.1,
            WorkerProfile::Balanced => 0.3,
            WorkerProfile::Aggressive => 0.7,
        }
    }

    /// Prompt fragment describing how this worker should behave.
    pub fn guidance(&self) -> &'static str {
        match self {
            WorkerProfile::Conservative => {
                "Favor proven, minimal solutions. Target at least 80% test coverage. \
                 Prefer standard library constructs over clever abstractions."
            }
            WorkerProfile::Balanced => {
                "Balance simplicity against thoroughness. Target at least 85% test \
                 coverage. Structure code for readability first."
            }
            WorkerProfile::Aggressive => {
                "Optimize for completeness. Target at least 90% test coverage, \
                 handle edge cases explicitly, and document non-obvious choices."
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerProfile::Conservative => "conservative",
            WorkerProfile::Balanced => "balanced",
            WorkerProfile::Aggressive => "aggressive",
        }
    }

    /// Tie-break preference: lower ranks win ties.
    pub fn preference_rank(&self) -> u8 {
        match self {
            WorkerProfile::Conservative => 0,
            WorkerProfile::Balanced => 1,
            WorkerProfile::Aggressive => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Implementation,
    Test,
}

/// One file produced by a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SolutionFile {
    pub path: String,
    pub content: String,
    pub kind: FileKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Succeeded,
    Failed,
    /// Rejected by the sandbox security scan. Does not fail the stage unless
    /// every peer is also disqualified.
    Disqualified,
}

/// Compressed sandbox verdict carried with each candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmokeTest {
    pub success: bool,
    pub exit_code: i32,
    pub killed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_reason: Option<String>,
}

/// What one worker produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeveloperResult {
    pub worker_id: u32,
    pub profile: WorkerProfile,
    pub status: WorkerStatus,
    #[serde(default)]
    pub files: Vec<SolutionFile>,
    #[serde(default)]
    pub notes: String,
    pub tokens_used: u64,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoke_test: Option<SmokeTest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeveloperResult {
    pub fn succeeded(&self) -> bool {
        self.status == WorkerStatus::Succeeded
    }

    pub fn implementation_files(&self) -> impl Iterator<Item = &SolutionFile> {
        self.files.iter().filter(|f| f.kind == FileKind::Implementation)
    }

    pub fn test_files(&self) -> impl Iterator<Item = &SolutionFile> {
        self.files.iter().filter(|f| f.kind == FileKind::Test)
    }

    /// Total artifact size, used by the simplicity bonus.
    pub fn total_bytes(&self) -> usize {
        self.files.iter().map(|f| f.content.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_assignment_is_deterministic() {
        assert_eq!(WorkerProfile::for_worker(1), WorkerProfile::Conservative);
        assert_eq!(WorkerProfile::for_worker(2), WorkerProfile::Aggressive);
        assert_eq!(WorkerProfile::for_worker(3), WorkerProfile::Balanced);
        assert_eq!(WorkerProfile::for_worker(4), WorkerProfile::Conservative);
    }

    #[test]
    fn test_coverage_targets_ordered_by_aggression() {
        assert!(
            WorkerProfile::Conservative.coverage_target()
                < WorkerProfile::Aggressive.coverage_target()
        );
    }

    #[test]
    fn test_conservative_wins_preference_ties() {
        assert!(
            WorkerProfile::Conservative.preference_rank()
                < WorkerProfile::Balanced.preference_rank()
        );
        assert!(
            WorkerProfile::Balanced.preference_rank() < WorkerProfile::Aggressive.preference_rank()
        );
    }

    #[test]
    fn test_result_file_partitions() {
        let result = DeveloperResult {
            worker_id: 1,
            profile: WorkerProfile::Conservative,
            status: WorkerStatus::Succeeded,
            files: vec![
                SolutionFile {
                    path: "lib.py".to_string(),
                    content: "def f(): pass".to_string(),
                    kind: FileKind::Implementation,
                },
                SolutionFile {
                    path: "test_lib.py".to_string(),
                    content: "assert True".to_string(),
                    kind: FileKind::Test,
                },
            ],
            notes: String::new(),
            tokens_used: 10,
            duration_seconds: 0.5,
            smoke_test: None,
            error: None,
        };
        assert_eq!(result.implementation_files().count(), 1);
        assert_eq!(result.test_files().count(), 1);
        assert_eq!(result.total_bytes(), 13 + 11);
    }
}
