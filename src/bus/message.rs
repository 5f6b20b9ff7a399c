//! Wire-stable message envelope carried by the bus.
//!
//! Consumers must ignore unknown top-level fields for forward compatibility,
//! so deserialization is deliberately permissive (no `deny_unknown_fields`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Current envelope protocol version.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Recipient name that broadcasts to every registered agent.
pub const BROADCAST: &str = "all";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    DataUpdate,
    Request,
    Response,
    Notification,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::DataUpdate => "data_update",
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Notification => "notification",
            MessageType::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Medium,
    High,
}

impl MessagePriority {
    /// Ordering rank; higher ranks are delivered first.
    pub fn rank(&self) -> u8 {
        match self {
            MessagePriority::Low => 0,
            MessagePriority::Medium => 1,
            MessagePriority::High => 2,
        }
    }
}

/// One message on the bus. Field set is wire-stable (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub from_agent: String,
    pub to_agent: String,
    pub message_type: MessageType,
    pub card_id: String,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl MessageEnvelope {
    pub fn new(from_agent: &str, to_agent: &str, message_type: MessageType, card_id: &str) -> Self {
        Self {
            protocol_version: default_protocol_version(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            from_agent: from_agent.to_string(),
            to_agent: to_agent.to_string(),
            message_type,
            card_id: card_id.to_string(),
            priority: MessagePriority::default(),
            data: Map::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.to_agent == BROADCAST
    }
}

/// Predicate set applied by [`MessageBus::read`](super::MessageBus::read).
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub message_type: Option<MessageType>,
    pub from_agent: Option<String>,
    pub priority: Option<MessagePriority>,
    pub unread_only: bool,
}

impl MessageFilter {
    pub fn unread() -> Self {
        Self {
            unread_only: true,
            ..Default::default()
        }
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn with_from(mut self, from_agent: &str) -> Self {
        self.from_agent = Some(from_agent.to_string());
        self
    }

    pub fn matches(&self, msg: &MessageEnvelope) -> bool {
        if let Some(t) = self.message_type
            && msg.message_type != t
        {
            return false;
        }
        if let Some(ref from) = self.from_agent
            && &msg.from_agent != from
        {
            return false;
        }
        if let Some(p) = self.priority
            && msg.priority != p
        {
            return false;
        }
        true
    }
}
