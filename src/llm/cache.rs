//! Deterministic completion cache keyed by request hash.
//!
//! One JSON file per entry under the cache directory. Entries expire after
//! the configured TTL (default 7 days); a hit returns the stored content
//! byte-identically and charges zero tokens.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key_hash: String,
    pub content: String,
    pub model: String,
    pub cached_at: DateTime<Utc>,
}

/// File-backed response cache.
pub struct ResponseCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(dir: &Path, ttl: Duration) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create cache dir: {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            ttl,
        })
    }

    pub fn with_default_ttl(dir: &Path) -> Result<Self> {
        Self::new(dir, Duration::days(DEFAULT_TTL_DAYS))
    }

    fn entry_path(&self, key_hash: &str) -> PathBuf {
        self.dir.join(format!("{key_hash}.json"))
    }

    /// Look up a fresh entry. Expired entries are treated as misses.
    pub fn get(&self, key_hash: &str) -> Option<CacheEntry> {
        let path = self.entry_path(key_hash);
        let content = fs::read_to_string(&path).ok()?;
        let entry: CacheEntry = serde_json::from_str(&content).ok()?;
        if Utc::now() - entry.cached_at > self.ttl {
            return None;
        }
        Some(entry)
    }

    pub fn put(&self, key_hash: &str, content: &str, model: &str) -> Result<()> {
        let entry = CacheEntry {
            key_hash: key_hash.to_string(),
            content: content.to_string(),
            model: model.to_string(),
            cached_at: Utc::now(),
        };
        let path = self.entry_path(key_hash);
        let json = serde_json::to_string_pretty(&entry).context("Failed to serialize cache entry")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write cache entry: {}", path.display()))?;
        Ok(())
    }
}
