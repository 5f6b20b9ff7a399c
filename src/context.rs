//! Write-once execution context threaded through successive stages.
//!
//! The orchestrator owns the [`Context`]; stages return new keys via their
//! output and never mutate the map directly. A stage overwriting an existing
//! key is a programmer error, so [`Context::insert`] rejects duplicates
//! instead of silently overlaying.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Conventional context keys written and read by the concrete stages.
pub mod keys {
    pub const RAG_INSIGHTS: &str = "rag_insights";
    pub const ANALYSIS_REPORT: &str = "analysis_report";
    pub const APPROVED_CHANGES: &str = "approved_changes";
    pub const ADR_FILE: &str = "adr_file";
    pub const DEPENDENCIES_IDENTIFIED: &str = "dependencies_identified";
    pub const REQUIREMENTS_FILE: &str = "requirements_file";
    pub const DEVELOPER_RESULTS: &str = "developer_results";
    pub const WINNER: &str = "winner";
    pub const REVIEW_SCORES: &str = "review_scores";
    pub const APPROVED_CANDIDATES: &str = "approved_candidates";
    pub const INTEGRATION_STATUS: &str = "integration_status";
    pub const TESTING_STATUS: &str = "testing_status";
    pub const PRODUCTION_READY: &str = "production_ready";
}

/// A key was written twice within one pipeline execution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Context key '{key}' written twice (second writer: {writer})")]
pub struct KeyCollision {
    pub key: String,
    /// The stage (or component) that attempted the second write.
    pub writer: String,
}

/// The key/value map threaded through stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
    values: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key, rejecting duplicates.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: Value,
        writer: &str,
    ) -> Result<(), KeyCollision> {
        let key = key.into();
        if self.values.contains_key(&key) {
            return Err(KeyCollision {
                key,
                writer: writer.to_string(),
            });
        }
        self.values.insert(key, value);
        Ok(())
    }

    /// Merge a batch of stage outputs. Fails on the first collision.
    pub fn merge(
        &mut self,
        updates: impl IntoIterator<Item = (String, Value)>,
        writer: &str,
    ) -> Result<(), KeyCollision> {
        for (key, value) in updates {
            self.insert(key, value, writer)?;
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Keys in deterministic (sorted) order, for reports and tests.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Snapshot as a JSON object, handed to stages read-only.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(&self.values).unwrap_or(Value::Null)
    }

    /// Rebuild a context from a checkpoint snapshot.
    pub fn from_value(value: &Value) -> Option<Self> {
        let values: BTreeMap<String, Value> = serde_json::from_value(value.clone()).ok()?;
        Some(Self { values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_and_get() {
        let mut ctx = Context::new();
        ctx.insert(keys::ADR_FILE, json!("adr/001.md"), "architecture")
            .unwrap();
        assert_eq!(ctx.get_str(keys::ADR_FILE), Some("adr/001.md"));
        assert!(ctx.contains(keys::ADR_FILE));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut ctx = Context::new();
        ctx.insert("winner", json!(1), "development").unwrap();
        let err = ctx.insert("winner", json!(2), "review").unwrap_err();
        assert_eq!(err.key, "winner");
        assert_eq!(err.writer, "review");
        // Original value untouched.
        assert_eq!(ctx.get("winner"), Some(&json!(1)));
    }

    #[test]
    fn test_merge_is_atomic_up_to_collision() {
        let mut ctx = Context::new();
        ctx.insert("a", json!(1), "setup").unwrap();

        let updates = vec![
            ("b".to_string(), json!(2)),
            ("a".to_string(), json!(99)),
            ("c".to_string(), json!(3)),
        ];
        let err = ctx.merge(updates, "stage-x").unwrap_err();
        assert_eq!(err.key, "a");
        // Keys before the collision landed; the colliding one did not.
        assert_eq!(ctx.get("b"), Some(&json!(2)));
        assert_eq!(ctx.get("a"), Some(&json!(1)));
        assert!(!ctx.contains("c"));
    }

    #[test]
    fn test_keys_are_sorted() {
        let mut ctx = Context::new();
        ctx.insert("zebra", json!(0), "t").unwrap();
        ctx.insert("alpha", json!(0), "t").unwrap();
        let keys: Vec<&str> = ctx.keys().collect();
        assert_eq!(keys, vec!["alpha", "zebra"]);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut ctx = Context::new();
        ctx.insert(keys::PRODUCTION_READY, json!(true), "testing")
            .unwrap();
        let value = ctx.to_value();
        assert_eq!(value[keys::PRODUCTION_READY], json!(true));
    }
}
