//! Canonical message types.
//!
//! Messages are the units of a conversation as the realtime layer sees
//! them. The persistence collaborator owns their durable form; this module
//! defines the in-flight representation shared by the channel, the client
//! store and the history endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A chat message, carried over the wire and held in the client store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique within a conversation. Client-assigned for user messages,
    /// server-assigned for assistant responses.
    pub id: String,

    /// Message role.
    pub role: Role,

    /// Message text. Grows chunk by chunk while an assistant response
    /// streams.
    #[serde(default)]
    pub content: String,

    /// Delivery status.
    pub status: MessageStatus,

    /// Enclosing conversation, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,

    /// Enclosing thread, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// Creation time (RFC 3339 on the wire).
    pub created_at: DateTime<Utc>,

    /// Provenance extras (forward-compatible, unknown keys survive a
    /// round trip).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ChatMessage {
    /// Build a user message with a fresh id, in `sending` state.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            status: MessageStatus::Sending,
            conversation_id: None,
            thread_id: None,
            created_at: Utc::now(),
            metadata: Map::new(),
        }
    }

    /// Build an empty assistant message for a response that is about to
    /// stream. The id is the server-allocated response id.
    pub fn assistant_pending(response_id: impl Into<String>) -> Self {
        Self {
            id: response_id.into(),
            role: Role::Assistant,
            content: String::new(),
            status: MessageStatus::Streaming,
            conversation_id: None,
            thread_id: None,
            created_at: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Insert or replace a metadata entry.
    pub fn set_meta(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    /// Metadata entry as a string, when present and a string.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

// ============================================================================
// Message metadata types
// ============================================================================

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Delivery status of a message.
///
/// `sending` and `streaming` are transient; the other states are where a
/// message comes to rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// User message awaiting server acknowledgement.
    Sending,
    /// Assistant message still receiving chunks.
    Streaming,
    /// Accepted by the server (user) or fully streamed (assistant).
    Sent,
    /// Confirmed persisted; history loads report this state.
    Delivered,
    /// Send or stream failed. Details live in `metadata["error"]`.
    Error,
}

impl MessageStatus {
    /// True once the message can no longer change state on its own.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Error)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sending => write!(f, "sending"),
            Self::Streaming => write!(f, "streaming"),
            Self::Sent => write!(f, "sent"),
            Self::Delivered => write!(f, "delivered"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sending" => Ok(Self::Sending),
            "streaming" => Ok(Self::Streaming),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown message status: {s}")),
        }
    }
}
