//! Candidate scoring and winner selection.
//!
//! Every successful candidate is scored on a fixed 100-point rubric:
//!
//! | Dimension              | Points |
//! |------------------------|--------|
//! | Syntax & structure     | 20     |
//! | TDD compliance         | 10     |
//! | Test coverage          | 15     |
//! | Test quality           | 20     |
//! | Functional correctness | 15     |
//! | Code quality           | 15     |
//! | Simplicity bonus       | 5      |
//!
//! Ties break by simplicity bonus, then coverage, then the conservative
//! profile preference. The checks are deterministic static measurements so
//! re-scoring the same candidate set always reproduces the same ranking.

use super::{DeveloperResult, WorkerProfile};
use serde::{Deserialize, Serialize};

/// Per-dimension points for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreBreakdown {
    pub syntax_structure: u32,
    pub tdd_compliance: u32,
    pub test_coverage: u32,
    pub test_quality: u32,
    pub functional_correctness: u32,
    pub code_quality: u32,
    pub simplicity_bonus: u32,
}

impl ScoreBreakdown {
    pub fn total(&self) -> u32 {
        self.syntax_structure
            + self.tdd_compliance
            + self.test_coverage
            + self.test_quality
            + self.functional_correctness
            + self.code_quality
            + self.simplicity_bonus
    }
}

/// One scored candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateScore {
    pub worker_id: u32,
    pub profile: WorkerProfile,
    pub breakdown: ScoreBreakdown,
    pub total: u32,
}

/// Score every successful candidate. Input order does not matter; output is
/// worker-id ascending.
pub fn score_candidates(
    results: &[DeveloperResult],
    acceptance_criteria: &[String],
) -> Vec<CandidateScore> {
    let mut successful: Vec<&DeveloperResult> =
        results.iter().filter(|r| r.succeeded()).collect();
    successful.sort_by_key(|r| r.worker_id);

    // Simplicity ranks by artifact size, smallest first.
    let mut by_size: Vec<(u32, usize)> = successful
        .iter()
        .map(|r| (r.worker_id, r.total_bytes()))
        .collect();
    by_size.sort_by_key(|(worker_id, bytes)| (*bytes, *worker_id));
    let simplicity_for = |worker_id: u32| -> u32 {
        match by_size.iter().position(|(id, _)| *id == worker_id) {
            Some(0) => 5,
            Some(1) => 3,
            Some(2) => 1,
            _ => 0,
        }
    };

    successful
        .iter()
        .map(|result| {
            let breakdown = ScoreBreakdown {
                syntax_structure: score_syntax(result),
                tdd_compliance: score_tdd(result),
                test_coverage: score_coverage(result),
                test_quality: score_test_quality(result),
                functional_correctness: score_functional(result, acceptance_criteria),
                code_quality: score_code_quality(result),
                simplicity_bonus: simplicity_for(result.worker_id),
            };
            CandidateScore {
                worker_id: result.worker_id,
                profile: result.profile,
                total: breakdown.total(),
                breakdown,
            }
        })
        .collect()
}

/// Highest total wins; ties break by (1) simplicity bonus, (2) coverage,
/// (3) conservative profile preference, (4) lowest worker id.
pub fn select_winner(scores: &[CandidateScore]) -> Option<&CandidateScore> {
    scores.iter().max_by(|a, b| {
        a.total
            .cmp(&b.total)
            .then(a.breakdown.simplicity_bonus.cmp(&b.breakdown.simplicity_bonus))
            .then(a.breakdown.test_coverage.cmp(&b.breakdown.test_coverage))
            .then(
                b.profile
                    .preference_rank()
                    .cmp(&a.profile.preference_rank()),
            )
            .then(b.worker_id.cmp(&a.worker_id))
    })
}

// ── Dimension checks ────────────────────────────────────────────────

/// 20 points: bracket balance across all files (10) plus non-trivial,
/// function-bearing implementation files (10).
fn score_syntax(result: &DeveloperResult) -> u32 {
    let balanced = result
        .files
        .iter()
        .all(|f| brackets_balanced(&f.content));
    let structured = result.implementation_files().count() > 0
        && result.implementation_files().all(|f| {
            !f.content.trim().is_empty()
                && (f.content.contains("def ")
                    || f.content.contains("function ")
                    || f.content.contains("=>")
                    || f.content.contains("class "))
        });
    (if balanced { 10 } else { 0 }) + (if structured { 10 } else { 0 })
}

/// 10 points: tests exist (6) and reference implementation symbols (4).
fn score_tdd(result: &DeveloperResult) -> u32 {
    let test_count = result.test_files().count();
    if test_count == 0 {
        return 0;
    }
    let impl_symbols: Vec<String> = result
        .implementation_files()
        .flat_map(|f| extract_symbols(&f.content))
        .collect();
    let references_impl = result
        .test_files()
        .any(|t| impl_symbols.iter().any(|s| t.content.contains(s.as_str())));
    6 + if references_impl { 4 } else { 0 }
}

/// 15 points, tiered on the test-to-implementation line ratio as the
/// measured-coverage proxy.
fn score_coverage(result: &DeveloperResult) -> u32 {
    let impl_lines: usize = result
        .implementation_files()
        .map(|f| f.content.lines().count())
        .sum();
    let test_lines: usize = result
        .test_files()
        .map(|f| f.content.lines().count())
        .sum();
    if impl_lines == 0 || test_lines == 0 {
        return 0;
    }
    let ratio = test_lines as f64 / impl_lines as f64;
    if ratio >= 0.9 {
        15
    } else if ratio >= 0.6 {
        12
    } else if ratio >= 0.3 {
        8
    } else {
        4
    }
}

/// 20 points: a passing smoke run (10) plus assertion count (up to 10).
fn score_test_quality(result: &DeveloperResult) -> u32 {
    let passing = result
        .smoke_test
        .as_ref()
        .map(|s| s.success)
        .unwrap_or(false);
    let assertions: usize = result
        .test_files()
        .map(|f| f.content.matches("assert").count() + f.content.matches("expect(").count())
        .sum();
    (if passing { 10 } else { 0 }) + (assertions.min(10) as u32)
}

/// 15 points: a passing smoke run (8) plus acceptance-criteria keywords
/// reflected in the artifact (up to 7).
fn score_functional(result: &DeveloperResult, acceptance_criteria: &[String]) -> u32 {
    let passing = result
        .smoke_test
        .as_ref()
        .map(|s| s.success)
        .unwrap_or(false);
    let base = if passing { 8 } else { 0 };
    if acceptance_criteria.is_empty() {
        // Nothing to verify against; grant the criteria share on a pass.
        return base + if passing { 7 } else { 0 };
    }

    let haystack: String = result
        .files
        .iter()
        .map(|f| f.content.to_lowercase())
        .chain(std::iter::once(result.notes.to_lowercase()))
        .collect::<Vec<_>>()
        .join("\n");
    let covered = acceptance_criteria
        .iter()
        .filter(|c| {
            c.to_lowercase()
                .split_whitespace()
                .filter(|w| w.len() > 3)
                .any(|w| haystack.contains(w))
        })
        .count();
    base + ((covered * 7 / acceptance_criteria.len().max(1)) as u32).min(7)
}

/// 15 points: commentary (5), readable line lengths (5), worker notes (5).
fn score_code_quality(result: &DeveloperResult) -> u32 {
    let has_docs = result.implementation_files().any(|f| {
        f.content.contains('#') || f.content.contains("\"\"\"") || f.content.contains("//")
    });
    let readable = result.files.iter().all(|f| {
        f.content.lines().all(|l| l.chars().count() <= 160)
    });
    let has_notes = !result.notes.trim().is_empty();
    (if has_docs { 5 } else { 0 }) + (if readable { 5 } else { 0 }) + (if has_notes { 5 } else { 0 })
}

fn brackets_balanced(content: &str) -> bool {
    let mut round = 0i64;
    let mut square = 0i64;
    let mut curly = 0i64;
    for c in content.chars() {
        match c {
            '(' => round += 1,
            ')' => round -= 1,
            '[' => square += 1,
            ']' => square -= 1,
            '{' => curly += 1,
            '}' => curly -= 1,
            _ => {}
        }
        if round < 0 || square < 0 || curly < 0 {
            return false;
        }
    }
    round == 0 && square == 0 && curly == 0
}

/// Function and class names defined in a file.
fn extract_symbols(content: &str) -> Vec<String> {
    let mut symbols = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        for prefix in ["def ", "class ", "function "] {
            if let Some(rest) = trimmed.strip_prefix(prefix) {
                let name: String = rest
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '_')
                    .collect();
                if !name.is_empty() {
                    symbols.push(name);
                }
            }
        }
    }
    symbols
}
