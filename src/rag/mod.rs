//! Append-only, vector-queryable artifact store (the RAG store).
//!
//! Every stage output is recorded here as a typed, card-scoped [`Artifact`]
//! with an embedding over its title and content. Artifacts are never mutated
//! or deleted; the on-disk form is one JSON line per artifact, replayed into
//! memory on open.

pub mod embedding;
mod recommend;

pub use embedding::{Embedder, HashEmbedder, cosine_similarity};
pub use recommend::{Confidence, Recommendations};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use uuid::Uuid;

/// The closed set of artifact types the pipeline produces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    ResearchReport,
    ProjectAnalysis,
    ArchitectureDecision,
    DeveloperSolution,
    CodeReview,
    ArbitrationScore,
    IntegrationResult,
    TestingResult,
    UnexpectedStateSolution,
    KanbanEvent,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::ResearchReport => "research_report",
            ArtifactType::ProjectAnalysis => "project_analysis",
            ArtifactType::ArchitectureDecision => "architecture_decision",
            ArtifactType::DeveloperSolution => "developer_solution",
            ArtifactType::CodeReview => "code_review",
            ArtifactType::ArbitrationScore => "arbitration_score",
            ArtifactType::IntegrationResult => "integration_result",
            ArtifactType::TestingResult => "testing_result",
            ArtifactType::UnexpectedStateSolution => "unexpected_state_solution",
            ArtifactType::KanbanEvent => "kanban_event",
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One stored record. Append-only; the core never mutates or deletes these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub artifact_type: ArtifactType,
    pub card_id: String,
    pub task_title: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub embedding: Vec<f32>,
    pub stored_at: DateTime<Utc>,
}

/// A query hit with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredArtifact {
    pub artifact: Artifact,
    pub similarity: f32,
}

/// The store. Embedding computation is injected; persistence is a JSON-lines
/// file under the store root.
pub struct ArtifactStore {
    path: PathBuf,
    embedder: Box<dyn Embedder>,
    artifacts: RwLock<Vec<Artifact>>,
}

impl ArtifactStore {
    /// Open (and create) a store rooted at `root`, replaying any existing
    /// records into memory.
    pub fn open(root: &Path, embedder: Box<dyn Embedder>) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create artifact store root: {}", root.display()))?;
        let path = root.join("artifacts.jsonl");

        let mut artifacts = Vec::new();
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read artifact store: {}", path.display()))?;
            for (idx, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let artifact: Artifact = serde_json::from_str(line).with_context(|| {
                    format!("Failed to parse artifact line {} in {}", idx + 1, path.display())
                })?;
                artifacts.push(artifact);
            }
        }

        Ok(Self {
            path,
            embedder,
            artifacts: RwLock::new(artifacts),
        })
    }

    /// Open a store with the default hash embedder.
    pub fn open_default(root: &Path) -> Result<Self> {
        Self::open(root, Box::new(HashEmbedder::default()))
    }

    /// Persist a new artifact. Returns its id.
    pub fn store(
        &self,
        artifact_type: ArtifactType,
        card_id: &str,
        task_title: &str,
        content: &str,
        metadata: Map<String, Value>,
    ) -> Result<String> {
        let embedding = self
            .embedder
            .embed(&format!("{task_title} {content}"));
        let artifact = Artifact {
            artifact_id: Uuid::new_v4().to_string(),
            artifact_type,
            card_id: card_id.to_string(),
            task_title: task_title.to_string(),
            content: content.to_string(),
            metadata,
            embedding,
            stored_at: Utc::now(),
        };

        let line = serde_json::to_string(&artifact).context("Failed to serialize artifact")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open artifact store: {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("Failed to append artifact: {}", self.path.display()))?;

        let id = artifact.artifact_id.clone();
        self.artifacts
            .write()
            .expect("artifact store lock poisoned")
            .push(artifact);

        tracing::debug!(artifact_id = %id, kind = artifact_type.as_str(), card_id, "artifact stored");
        Ok(id)
    }

    /// Top-k artifacts by cosine similarity to `query_text`, optionally
    /// restricted by type and by metadata equality predicates.
    pub fn query_similar(
        &self,
        query_text: &str,
        types: Option<&[ArtifactType]>,
        top_k: usize,
        filters: Option<&Map<String, Value>>,
    ) -> Vec<ScoredArtifact> {
        let query = self.embedder.embed(query_text);
        let artifacts = self.artifacts.read().expect("artifact store lock poisoned");

        let mut scored: Vec<ScoredArtifact> = artifacts
            .iter()
            .filter(|a| types.is_none_or(|ts| ts.contains(&a.artifact_type)))
            .filter(|a| {
                filters.is_none_or(|f| {
                    f.iter().all(|(key, expected)| {
                        a.metadata.get(key).is_some_and(|actual| actual == expected)
                    })
                })
            })
            .map(|a| ScoredArtifact {
                similarity: cosine_similarity(&query, &a.embedding),
                artifact: a.clone(),
            })
            .collect();

        scored.sort_by(|x, y| {
            y.similarity
                .partial_cmp(&x.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        scored
    }

    pub fn len(&self) -> usize {
        self.artifacts.read().expect("artifact store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All artifacts of a type for a card, insertion order.
    pub fn by_type(&self, card_id: &str, artifact_type: ArtifactType) -> Vec<Artifact> {
        self.artifacts
            .read()
            .expect("artifact store lock poisoned")
            .iter()
            .filter(|a| a.card_id == card_id && a.artifact_type == artifact_type)
            .cloned()
            .collect()
    }

    pub fn get(&self, artifact_id: &str) -> Option<Artifact> {
        self.artifacts
            .read()
            .expect("artifact store lock poisoned")
            .iter()
            .find(|a| a.artifact_id == artifact_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn meta(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_store_and_query_round_trip() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_default(dir.path()).unwrap();

        let id = store
            .store(
                ArtifactType::ArchitectureDecision,
                "c-1",
                "OAuth refresh rotation",
                "Use short-lived access tokens with rotating refresh tokens",
                Map::new(),
            )
            .unwrap();

        let hits = store.query_similar("oauth refresh tokens", None, 5, None);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].artifact.artifact_id, id);
        assert!(hits[0].similarity > 0.0);
    }

    #[test]
    fn test_reopen_replays_persisted_artifacts() {
        let dir = tempdir().unwrap();
        {
            let store = ArtifactStore::open_default(dir.path()).unwrap();
            store
                .store(
                    ArtifactType::TestingResult,
                    "c-1",
                    "Suite run",
                    "All 42 tests passed",
                    Map::new(),
                )
                .unwrap();
        }

        let reopened = ArtifactStore::open_default(dir.path()).unwrap();
        assert_eq!(reopened.len(), 1);
        let hits = reopened.query_similar("tests passed", None, 1, None);
        assert_eq!(hits[0].artifact.content, "All 42 tests passed");
    }

    #[test]
    fn test_type_filter_restricts_results() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_default(dir.path()).unwrap();

        store
            .store(
                ArtifactType::CodeReview,
                "c-1",
                "token handling review",
                "looks good",
                Map::new(),
            )
            .unwrap();
        store
            .store(
                ArtifactType::ArbitrationScore,
                "c-1",
                "token handling arbitration",
                "worker 2 wins",
                Map::new(),
            )
            .unwrap();

        let hits = store.query_similar(
            "token handling",
            Some(&[ArtifactType::ArbitrationScore]),
            10,
            None,
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].artifact.artifact_type, ArtifactType::ArbitrationScore);
    }

    #[test]
    fn test_metadata_filter() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_default(dir.path()).unwrap();

        store
            .store(
                ArtifactType::DeveloperSolution,
                "c-1",
                "solution a",
                "code",
                meta(&[("worker_id", json!(1))]),
            )
            .unwrap();
        store
            .store(
                ArtifactType::DeveloperSolution,
                "c-1",
                "solution b",
                "code",
                meta(&[("worker_id", json!(2))]),
            )
            .unwrap();

        let filter = meta(&[("worker_id", json!(2))]);
        let hits = store.query_similar("solution", None, 10, Some(&filter));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].artifact.task_title, "solution b");
    }

    #[test]
    fn test_append_only_survives_further_stores() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_default(dir.path()).unwrap();

        let id = store
            .store(
                ArtifactType::ResearchReport,
                "c-1",
                "first report",
                "alpha beta gamma",
                Map::new(),
            )
            .unwrap();

        for i in 0..10 {
            store
                .store(
                    ArtifactType::ResearchReport,
                    "c-1",
                    &format!("report {i}"),
                    "unrelated content entirely",
                    Map::new(),
                )
                .unwrap();
        }

        let hits = store.query_similar("alpha beta gamma first report", None, 11, None);
        assert!(
            hits.iter().any(|h| h.artifact.artifact_id == id),
            "earlier artifact must never disappear from queries"
        );
    }

    #[test]
    fn test_by_type_scoped_to_card() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_default(dir.path()).unwrap();

        store
            .store(ArtifactType::KanbanEvent, "c-1", "moved", "todo -> doing", Map::new())
            .unwrap();
        store
            .store(ArtifactType::KanbanEvent, "c-2", "moved", "todo -> doing", Map::new())
            .unwrap();

        assert_eq!(store.by_type("c-1", ArtifactType::KanbanEvent).len(), 1);
        assert_eq!(store.by_type("c-3", ArtifactType::KanbanEvent).len(), 0);
    }
}
