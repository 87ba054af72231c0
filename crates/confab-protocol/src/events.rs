//! Wire events for the realtime channel.
//!
//! Both directions use tagged JSON objects; the `type` field selects the
//! event and keeps the `family:action` names of the chat protocol. Inbound
//! frames are validated here, at the boundary, so component logic never
//! sees raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::messages::ChatMessage;

// ============================================================================
// Events (Server -> Client)
// ============================================================================

/// Events the server pushes over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Hello after the transport handshake completes.
    #[serde(rename = "connected")]
    Connected,

    /// Keepalive probe. Clients answer with `pong`.
    #[serde(rename = "ping")]
    Ping,

    /// Acknowledgement of a client frame that carried an `ack` id.
    #[serde(rename = "ack")]
    Ack {
        id: u64,
        /// Set when the server accepted the frame but refused the request.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// An assistant response is about to stream.
    #[serde(rename = "stream:start")]
    StreamStart {
        response_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },

    /// One unit of streamed content.
    #[serde(rename = "stream:chunk")]
    StreamChunk {
        response_id: String,
        chunk: String,
        /// Per-response sequence number, starting at 0.
        seq: u64,
    },

    /// Stream finished. `content`, when present, is the server's
    /// authoritative final text and replaces the accumulated chunks.
    #[serde(rename = "stream:complete")]
    StreamComplete {
        response_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Map<String, Value>,
    },

    /// Stream failed server-side. The response is terminal.
    #[serde(rename = "stream:error")]
    StreamError { response_id: String, error: String },

    /// A complete message from another origin, e.g. a second session on
    /// the same conversation.
    #[serde(rename = "message:new")]
    MessageNew { message: ChatMessage },
}

impl ServerEvent {
    /// Decode and validate one inbound text frame.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let event: ServerEvent = serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed {
            detail: e.to_string(),
        })?;
        event.validate()?;
        Ok(event)
    }

    /// The name carried in the `type` field, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Ping => "ping",
            Self::Ack { .. } => "ack",
            Self::StreamStart { .. } => "stream:start",
            Self::StreamChunk { .. } => "stream:chunk",
            Self::StreamComplete { .. } => "stream:complete",
            Self::StreamError { .. } => "stream:error",
            Self::MessageNew { .. } => "message:new",
        }
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        let empty = |field| ProtocolError::EmptyField {
            event: self.kind(),
            field,
        };
        match self {
            Self::StreamStart { response_id, .. }
            | Self::StreamChunk { response_id, .. }
            | Self::StreamComplete { response_id, .. }
            | Self::StreamError { response_id, .. }
                if response_id.is_empty() =>
            {
                Err(empty("response_id"))
            }
            Self::MessageNew { message } if message.id.is_empty() => Err(empty("message.id")),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Events (Client -> Server)
// ============================================================================

/// Events the client sends over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Keepalive reply.
    #[serde(rename = "pong")]
    Pong,

    /// Submit a user message. `metadata` pre-allocates the id pair the
    /// server will answer with.
    #[serde(rename = "message:send")]
    MessageSend {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        metadata: SendIds,
    },

    /// Ask the server to stop an in-flight response. Terminalization
    /// arrives as a regular `stream:error` for the same response id.
    #[serde(rename = "message:cancel")]
    MessageCancel { response_id: String },
}

/// Correlation ids carried by `message:send`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendIds {
    /// Id of the user message being submitted.
    pub request_id: String,
    /// Pre-allocated id for the assistant response.
    pub response_id: String,
}

/// Envelope for outbound frames.
///
/// `ack`, when set, asks the server to answer with an [`ServerEvent::Ack`]
/// carrying the same id. The id lives beside the event's own fields in the
/// serialized object, so servers that ignore acknowledgements still parse
/// the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    pub event: ClientEvent,
    pub ack: Option<u64>,
}

impl ClientFrame {
    pub fn new(event: ClientEvent) -> Self {
        Self { event, ack: None }
    }

    pub fn with_ack(event: ClientEvent, id: u64) -> Self {
        Self {
            event,
            ack: Some(id),
        }
    }

    /// Serialize to a wire frame, splicing the ack id into the JSON object.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let mut value = serde_json::to_value(&self.event).map_err(|e| ProtocolError::Encode {
            detail: e.to_string(),
        })?;
        if let (Some(id), Some(object)) = (self.ack, value.as_object_mut()) {
            object.insert("ack".to_string(), Value::from(id));
        }
        serde_json::to_string(&value).map_err(|e| ProtocolError::Encode {
            detail: e.to_string(),
        })
    }

    /// Decode one inbound text frame on the server side.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let mut value: Value =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed {
                detail: e.to_string(),
            })?;
        let ack = value
            .as_object_mut()
            .and_then(|object| object.remove("ack"))
            .and_then(|id| id.as_u64());
        let event: ClientEvent =
            serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
                detail: e.to_string(),
            })?;
        Ok(Self { event, ack })
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while decoding or validating wire frames.
///
/// Receivers log these and drop the frame; a bad frame never brings down
/// the read loop.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON for any known event.
    #[error("malformed frame: {detail}")]
    Malformed { detail: String },

    /// A required field is present but empty.
    #[error("empty field `{field}` in `{event}` event")]
    EmptyField {
        event: &'static str,
        field: &'static str,
    },

    /// An outbound event failed to serialize.
    #[error("failed to encode frame: {detail}")]
    Encode { detail: String },
}
