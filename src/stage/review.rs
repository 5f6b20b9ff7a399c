//! Code review stage: deterministic static review of every successful
//! candidate, producing per-candidate scores on a 0–100 scale.

use super::{Stage, StageName, StageOutput, StageServices, require_typed};
use crate::card::Card;
use crate::context::{Context, keys};
use crate::developer::DeveloperResult;
use crate::errors::StageFailure;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// One candidate's review verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewScore {
    pub worker_id: u32,
    pub score: u32,
    pub findings: Vec<String>,
}

pub struct ReviewStage;

#[async_trait]
impl Stage for ReviewStage {
    fn name(&self) -> StageName {
        StageName::Review
    }

    fn setup(&self, _card: &Card, ctx: &Context) -> Result<(), StageFailure> {
        require_typed::<Vec<DeveloperResult>>(ctx, keys::DEVELOPER_RESULTS)?;
        Ok(())
    }

    async fn execute_stage(
        &self,
        _card: &Card,
        ctx: &Context,
        _services: &StageServices,
        _token: &CancellationToken,
    ) -> Result<StageOutput, StageFailure> {
        let results: Vec<DeveloperResult> = require_typed(ctx, keys::DEVELOPER_RESULTS)?;

        let scores: Vec<ReviewScore> = results
            .iter()
            .filter(|r| r.succeeded())
            .map(review_candidate)
            .collect();
        if scores.is_empty() {
            return Err(StageFailure::contract(
                "review has no successful candidates to score",
            ));
        }

        Ok(StageOutput::new(json!({"scores": scores}))
            .with_context_update(keys::REVIEW_SCORES, json!(scores)))
    }
}

fn review_candidate(result: &DeveloperResult) -> ReviewScore {
    let mut score = 0u32;
    let mut findings = Vec::new();

    if result.test_files().count() > 0 {
        score += 30;
    } else {
        findings.push("no tests shipped with the candidate".to_string());
    }

    if result.smoke_test.as_ref().map(|s| s.success).unwrap_or(false) {
        score += 40;
    } else {
        findings.push("smoke run did not pass".to_string());
    }

    let documented = result
        .implementation_files()
        .any(|f| f.content.contains('#') || f.content.contains("\"\"\"") || f.content.contains("//"));
    if documented {
        score += 15;
    } else {
        findings.push("implementation carries no commentary".to_string());
    }

    let readable = result
        .files
        .iter()
        .all(|f| f.content.lines().all(|l| l.chars().count() <= 160));
    if readable {
        score += 15;
    } else {
        findings.push("over-long lines hurt readability".to_string());
    }

    ReviewScore {
        worker_id: result.worker_id,
        score,
        findings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::developer::{FileKind, SmokeTest, SolutionFile, WorkerProfile, WorkerStatus};

    fn candidate(worker_id: u32, with_tests: bool, passing: bool) -> DeveloperResult {
        let mut files = vec![SolutionFile {
            path: "lib.py".to_string(),
            content: "# impl\ndef f():\n    return 1\n".to_string(),
            kind: FileKind::Implementation,
        }];
        if with_tests {
            files.push(SolutionFile {
                path: "test_lib.py".to_string(),
                content: "assert f() == 1\n".to_string(),
                kind: FileKind::Test,
            });
        }
        DeveloperResult {
            worker_id,
            profile: WorkerProfile::for_worker(worker_id),
            status: WorkerStatus::Succeeded,
            files,
            notes: String::new(),
            tokens_used: 1,
            duration_seconds: 0.1,
            smoke_test: Some(SmokeTest {
                success: passing,
                exit_code: if passing { 0 } else { 1 },
                killed: false,
                kill_reason: None,
            }),
            error: None,
        }
    }

    #[test]
    fn test_full_marks_for_clean_candidate() {
        let review = review_candidate(&candidate(1, true, true));
        assert_eq!(review.score, 100);
        assert!(review.findings.is_empty());
    }

    #[test]
    fn test_missing_tests_and_failures_are_findings() {
        let review = review_candidate(&candidate(2, false, false));
        assert_eq!(review.score, 30);
        assert_eq!(review.findings.len(), 2);
    }

    #[tokio::test]
    async fn test_review_scores_land_in_context() {
        let dir = tempfile::tempdir().unwrap();
        let services = crate::stage::testutil::services(dir.path());

        let mut ctx = Context::new();
        ctx.insert(
            keys::DEVELOPER_RESULTS,
            serde_json::to_value([candidate(1, true, true), candidate(2, false, true)]).unwrap(),
            "development",
        )
        .unwrap();

        let output = ReviewStage
            .execute_stage(
                &Card::new("c-1", "t"),
                &ctx,
                &services,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let scores = output
            .context_updates
            .iter()
            .find(|(k, _)| k == keys::REVIEW_SCORES)
            .map(|(_, v)| v.as_array().unwrap().len());
        assert_eq!(scores, Some(2));
    }

    #[tokio::test]
    async fn test_no_candidates_is_contract_violation() {
        let dir = tempfile::tempdir().unwrap();
        let services = crate::stage::testutil::services(dir.path());

        let mut ctx = Context::new();
        ctx.insert(keys::DEVELOPER_RESULTS, json!([]), "development")
            .unwrap();

        let err = ReviewStage
            .execute_stage(
                &Card::new("c-1", "t"),
                &ctx,
                &services,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::errors::FailureKind::ContractViolation);
    }
}
