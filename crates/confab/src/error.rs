//! Client error taxonomy.
//!
//! Transport problems are recoverable and mostly handled inside the
//! channel's reconnection machinery; callers meet them on the send path or
//! after the retry budget runs out. Application errors are caller mistakes
//! reported before anything touches the wire. Protocol errors never leave
//! the frame boundary, see `confab-protocol`.

use std::time::Duration;

use thiserror::Error;

pub use confab_protocol::ProtocolError;

/// Connection-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No live connection right now. Safe to retry after the next
    /// `connected` transition.
    #[error("channel is not connected")]
    NotConnected,

    /// The TCP or WebSocket handshake did not produce a connection.
    #[error("connection handshake failed: {0}")]
    Handshake(String),

    /// The server acknowledged the frame but refused the request.
    #[error("server rejected the frame: {0}")]
    Rejected(String),

    /// No acknowledgement within the deadline. The channel recycles its
    /// socket when this fires.
    #[error("acknowledgement timed out after {0:?}")]
    AckTimeout(Duration),

    /// The connection dropped while an acknowledgement was pending.
    #[error("connection lost while waiting for acknowledgement")]
    ConnectionLost,

    /// The reconnection budget is spent; the channel is in the `failed`
    /// state until `connect` is called again.
    #[error("gave up after {attempts} reconnection attempts")]
    RetriesExhausted { attempts: u32 },

    /// Waiting for the `connected` state took longer than allowed.
    #[error("timed out waiting for connection")]
    ConnectTimeout,

    /// The channel was shut down while the operation was in flight.
    #[error("channel is closed")]
    Closed,

    /// An outbound frame failed to serialize.
    #[error("failed to encode outbound frame: {0}")]
    Encode(String),
}

/// Caller mistakes, reported synchronously.
#[derive(Debug, Error)]
pub enum ApplicationError {
    /// Empty or whitespace-only message content.
    #[error("message content is empty")]
    EmptyMessage,

    /// The client was shut down and no longer accepts work.
    #[error("client is shut down")]
    ClientClosed,
}

/// Umbrella error for the public client API.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Application(#[from] ApplicationError),
}

impl ClientError {
    /// True when the caller may simply try again later, typically after
    /// the channel reports `connected`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(
                TransportError::NotConnected
                    | TransportError::AckTimeout(_)
                    | TransportError::ConnectionLost
                    | TransportError::ConnectTimeout
            )
        )
    }
}
