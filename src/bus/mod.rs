//! File-backed messaging bus: per-agent mailboxes, broadcast, shared state,
//! and an append-only audit log.
//!
//! Layout under the mailbox root:
//!
//! ```text
//! <root>/registry.json                     agent registrations
//! <root>/<agent>/<ts>_<from>_to_<to>_<type>.json   one file per message
//! <root>/<agent>/.read.json                read-set (message ids)
//! <root>/logs/<agent>.log                  JSON-lines audit log
//! <root>/shared_state.json                 per-card shared-state blobs
//! ```
//!
//! Delivery is single-host, at-least-once. Within one (sender, recipient)
//! pair messages arrive in send order; cross-sender ordering is not
//! guaranteed. A write that cannot be persisted is fatal to the caller.

mod message;

pub use message::{
    BROADCAST, MessageEnvelope, MessageFilter, MessagePriority, MessageType, PROTOCOL_VERSION,
};

use crate::errors::BusError;
use anyhow::Context;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub name: String,
    pub capabilities: Vec<String>,
    pub status: String,
    pub registered_at: DateTime<Utc>,
}

/// Per-card shared-state blob, merged by shallow overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedState {
    pub card_id: String,
    #[serde(default)]
    pub shared_data: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

impl SharedState {
    fn empty(card_id: &str) -> Self {
        Self {
            card_id: card_id.to_string(),
            shared_data: Map::new(),
            updated_at: Utc::now(),
        }
    }
}

/// The bus. All state lives on disk; the struct is cheap to clone paths from
/// and safe to share behind an `Arc`.
pub struct MessageBus {
    root: PathBuf,
}

impl MessageBus {
    /// Open (and create) a bus rooted at `root`.
    pub fn new(root: &Path) -> Result<Self, BusError> {
        fs::create_dir_all(root.join("logs"))
            .with_context(|| format!("Failed to create mailbox root: {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── Registration ────────────────────────────────────────────────

    /// Record an agent's presence. Re-registering updates capabilities and
    /// status in place.
    pub fn register(
        &self,
        agent_name: &str,
        capabilities: Vec<String>,
        status: &str,
    ) -> Result<(), BusError> {
        let mut registry = self.load_registry()?;
        registry.insert(
            agent_name.to_string(),
            AgentRegistration {
                name: agent_name.to_string(),
                capabilities,
                status: status.to_string(),
                registered_at: Utc::now(),
            },
        );
        self.save_registry(&registry)?;
        fs::create_dir_all(self.inbox_dir(agent_name))
            .with_context(|| format!("Failed to create inbox for {agent_name}"))?;
        Ok(())
    }

    /// Names of all currently-registered agents, sorted.
    pub fn registered_agents(&self) -> Result<Vec<String>, BusError> {
        Ok(self.load_registry()?.into_keys().collect())
    }

    // ── Send / read ─────────────────────────────────────────────────

    /// Persist a message to its recipient's inbox, or to every registered
    /// agent's inbox for a broadcast. Idempotent on `message_id`. Returns the
    /// paths written.
    pub fn send(&self, msg: &MessageEnvelope) -> Result<Vec<PathBuf>, BusError> {
        let recipients: Vec<String> = if msg.is_broadcast() {
            // Broadcast fans out to agents registered at the moment of send.
            self.registered_agents()?
        } else {
            vec![msg.to_agent.clone()]
        };

        let mut written = Vec::new();
        for recipient in &recipients {
            if self.inbox_contains(recipient, &msg.message_id)? {
                continue;
            }
            let path = self.deliver_to(recipient, msg)?;
            self.append_audit(recipient, "deliver", msg)?;
            written.push(path);
        }
        self.append_audit(&msg.from_agent, "send", msg)?;

        tracing::debug!(
            message_id = %msg.message_id,
            from = %msg.from_agent,
            to = %msg.to_agent,
            kind = msg.message_type.as_str(),
            recipients = written.len(),
            "message sent"
        );
        Ok(written)
    }

    /// Read an agent's inbox. Highest priority first, then FIFO within a
    /// priority.
    pub fn read(
        &self,
        agent_name: &str,
        filter: &MessageFilter,
    ) -> Result<Vec<MessageEnvelope>, BusError> {
        let inbox = self.inbox_dir(agent_name);
        if !inbox.exists() {
            return Ok(Vec::new());
        }

        let read_set = self.load_read_set(agent_name)?;
        let mut entries: Vec<(String, MessageEnvelope)> = Vec::new();

        for entry in WalkDir::new(&inbox).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| BusError::Other(e.into()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !entry.file_type().is_file() || !name.ends_with(".json") || name.starts_with('.') {
                continue;
            }
            let content = fs::read_to_string(entry.path())
                .with_context(|| format!("Failed to read message file: {}", name))?;
            let msg: MessageEnvelope = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse message file: {}", name))?;

            if filter.unread_only && read_set.contains(&msg.message_id) {
                continue;
            }
            if filter.matches(&msg) {
                entries.push((name, msg));
            }
        }

        // Stable sort: filename order (FIFO) is preserved within a priority.
        entries.sort_by_key(|(_, m)| std::cmp::Reverse(m.priority.rank()));
        Ok(entries.into_iter().map(|(_, m)| m).collect())
    }

    /// Move a message out of an agent's unread set.
    pub fn mark_read(&self, agent_name: &str, message_id: &str) -> Result<(), BusError> {
        let mut read_set = self.load_read_set(agent_name)?;
        read_set.insert(message_id.to_string());
        let path = self.read_set_path(agent_name);
        let json = serde_json::to_string(&read_set).context("Failed to serialize read set")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write read set: {}", path.display()))?;
        Ok(())
    }

    // ── Shared state ────────────────────────────────────────────────

    /// Read a card's shared-state blob.
    pub fn get_shared_state(&self, card_id: &str) -> Result<SharedState, BusError> {
        let _lock = self.lock_shared_state()?;
        let blobs = self.load_shared_blobs()?;
        Ok(blobs
            .get(card_id)
            .cloned()
            .unwrap_or_else(|| SharedState::empty(card_id)))
    }

    /// Merge a delta into a card's shared state. Shallow overlay: keys in
    /// `delta` overwrite keys in `shared_data`.
    pub fn update_shared_state(
        &self,
        card_id: &str,
        delta: Map<String, Value>,
    ) -> Result<SharedState, BusError> {
        let _lock = self.lock_shared_state()?;
        let mut blobs = self.load_shared_blobs()?;
        let blob = blobs
            .entry(card_id.to_string())
            .or_insert_with(|| SharedState::empty(card_id));
        for (key, value) in delta {
            blob.shared_data.insert(key, value);
        }
        blob.updated_at = Utc::now();
        let updated = blob.clone();
        self.save_shared_blobs(&blobs)?;
        Ok(updated)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn inbox_dir(&self, agent_name: &str) -> PathBuf {
        self.root.join(agent_name)
    }

    fn read_set_path(&self, agent_name: &str) -> PathBuf {
        self.inbox_dir(agent_name).join(".read.json")
    }

    fn registry_path(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    fn shared_state_path(&self) -> PathBuf {
        self.root.join("shared_state.json")
    }

    fn load_registry(&self) -> Result<BTreeMap<String, AgentRegistration>, BusError> {
        let path = self.registry_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read registry: {}", path.display()))?;
        Ok(serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse registry: {}", path.display()))?)
    }

    fn save_registry(&self, registry: &BTreeMap<String, AgentRegistration>) -> Result<(), BusError> {
        let path = self.registry_path();
        let json =
            serde_json::to_string_pretty(registry).context("Failed to serialize registry")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write registry: {}", path.display()))?;
        Ok(())
    }

    fn inbox_contains(&self, agent_name: &str, message_id: &str) -> Result<bool, BusError> {
        let inbox = self.inbox_dir(agent_name);
        if !inbox.exists() {
            return Ok(false);
        }
        let needle = format!("\"{message_id}\"");
        for entry in fs::read_dir(&inbox).with_context(|| "Failed to list inbox")? {
            let entry = entry.with_context(|| "Failed to list inbox entry")?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json") || name.starts_with('.') {
                continue;
            }
            let content = fs::read_to_string(entry.path())
                .with_context(|| format!("Failed to read message file: {}", name))?;
            if content.contains(&needle) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn deliver_to(&self, recipient: &str, msg: &MessageEnvelope) -> Result<PathBuf, BusError> {
        let inbox = self.inbox_dir(recipient);
        fs::create_dir_all(&inbox)
            .with_context(|| format!("Failed to create inbox for {recipient}"))?;

        let stem = format!(
            "{}_{}_to_{}_{}",
            msg.timestamp.format("%Y%m%dT%H%M%S%6f"),
            msg.from_agent,
            msg.to_agent,
            msg.message_type.as_str()
        );
        let mut path = inbox.join(format!("{stem}.json"));
        let mut seq = 0;
        while path.exists() {
            seq += 1;
            path = inbox.join(format!("{stem}_{seq}.json"));
        }

        let json = serde_json::to_string_pretty(msg).context("Failed to serialize message")?;
        fs::write(&path, json).map_err(|source| BusError::PersistFailed {
            message_id: msg.message_id.clone(),
            source,
        })?;
        Ok(path)
    }

    fn append_audit(&self, agent: &str, event: &str, msg: &MessageEnvelope) -> Result<(), BusError> {
        let record = serde_json::json!({
            "event": event,
            "message_id": msg.message_id,
            "timestamp": Utc::now(),
            "from_agent": msg.from_agent,
            "to_agent": msg.to_agent,
            "message_type": msg.message_type.as_str(),
            "card_id": msg.card_id,
            "priority": msg.priority,
        });
        let path = self.root.join("logs").join(format!("{agent}.log"));
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open audit log: {}", path.display()))?;
        writeln!(file, "{record}").map_err(|source| BusError::PersistFailed {
            message_id: msg.message_id.clone(),
            source,
        })?;
        Ok(())
    }

    fn load_read_set(&self, agent_name: &str) -> Result<BTreeSet<String>, BusError> {
        let path = self.read_set_path(agent_name);
        if !path.exists() {
            return Ok(BTreeSet::new());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read read-set: {}", path.display()))?;
        Ok(serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse read-set: {}", path.display()))?)
    }

    /// Advisory lock held for the duration of a shared-state read or RMW.
    fn lock_shared_state(&self) -> Result<fs::File, BusError> {
        let path = self.root.join(".shared_state.lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open shared-state lock: {}", path.display()))?;
        file.lock_exclusive()
            .context("Failed to acquire shared-state lock")?;
        Ok(file)
    }

    fn load_shared_blobs(&self) -> Result<BTreeMap<String, SharedState>, BusError> {
        let path = self.shared_state_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read shared state: {}", path.display()))?;
        Ok(serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse shared state: {}", path.display()))?)
    }

    fn save_shared_blobs(&self, blobs: &BTreeMap<String, SharedState>) -> Result<(), BusError> {
        let path = self.shared_state_path();
        let json = serde_json::to_string_pretty(blobs).context("Failed to serialize shared state")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write shared state: {}", path.display()))?;
        Ok(())
    }
}
