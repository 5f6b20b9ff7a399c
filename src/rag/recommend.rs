//! Institutional-memory recommendations derived from past outcomes.
//!
//! Looks at arbitration, integration, and testing artifacts from earlier
//! runs that resemble the incoming task, and distills what to reuse and what
//! to avoid.

use super::{ArtifactStore, ArtifactType, ScoredArtifact};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hits below this similarity are not evidence of a related task.
const MIN_SIMILARITY: f32 = 0.05;

/// How many prior outcomes to consider.
const TOP_K: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    High,
    VeryHigh,
}

impl Confidence {
    fn from_count(count: usize) -> Self {
        match count {
            0 => Confidence::Low,
            1..=2 => Confidence::High,
            _ => Confidence::VeryHigh,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::High => "high",
            Confidence::VeryHigh => "very_high",
        }
    }
}

/// What the store recommends for an incoming task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendations {
    pub similar_tasks_count: usize,
    pub confidence: Confidence,
    pub recommend: Vec<String>,
    pub avoid: Vec<String>,
}

impl Recommendations {
    pub fn empty() -> Self {
        Self {
            similar_tasks_count: 0,
            confidence: Confidence::Low,
            recommend: Vec::new(),
            avoid: Vec::new(),
        }
    }
}

impl ArtifactStore {
    /// Aggregate winning technologies and known blockers from similar past
    /// tasks.
    pub fn recommendations(&self, task_description: &str) -> Recommendations {
        let hits: Vec<ScoredArtifact> = self
            .query_similar(
                task_description,
                Some(&[
                    ArtifactType::ArbitrationScore,
                    ArtifactType::IntegrationResult,
                    ArtifactType::TestingResult,
                ]),
                TOP_K,
                None,
            )
            .into_iter()
            .filter(|h| h.similarity >= MIN_SIMILARITY)
            .collect();

        let mut recommend = Vec::new();
        let mut avoid = Vec::new();

        for hit in &hits {
            let artifact = &hit.artifact;
            match artifact.artifact_type {
                ArtifactType::ArbitrationScore => {
                    collect_strings(&artifact.metadata, "winning_technologies", &mut recommend);
                }
                ArtifactType::IntegrationResult | ArtifactType::TestingResult => {
                    collect_strings(&artifact.metadata, "blockers", &mut avoid);
                }
                _ => {}
            }
        }

        dedup_preserving_order(&mut recommend);
        dedup_preserving_order(&mut avoid);

        Recommendations {
            similar_tasks_count: hits.len(),
            confidence: Confidence::from_count(hits.len()),
            recommend,
            avoid,
        }
    }
}

fn collect_strings(metadata: &serde_json::Map<String, Value>, key: &str, into: &mut Vec<String>) {
    if let Some(Value::Array(items)) = metadata.get(key) {
        for item in items {
            if let Some(s) = item.as_str() {
                into.push(s.to_string());
            }
        }
    }
}

fn dedup_preserving_order(items: &mut Vec<String>) {
    let mut seen = std::collections::BTreeSet::new();
    items.retain(|item| seen.insert(item.clone()));
}
