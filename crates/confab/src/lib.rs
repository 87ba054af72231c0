//! Confab Realtime Core
//!
//! This library provides the message-delivery components of the Confab
//! chat client: one reconnecting WebSocket channel, exactly-once event
//! application, streamed response assembly and reconnect-driven history
//! sync.

pub mod channel;
pub mod client;
pub mod dedup;
pub mod error;
pub mod history;
pub mod resync;
pub mod store;
pub mod stream;

pub use channel::{Channel, ChannelConfig, ChannelItem, ConnectionState};
pub use client::{global, init_global, reset_global, ChatClient, ClientConfig, SendReceipt};
pub use error::{ApplicationError, ClientError, TransportError};
pub use history::{HistoryError, HttpHistory, MessageHistory, StaticHistory};
pub use resync::ReconnectCoordinator;
pub use store::{ChatState, ChatStore, MessagePatch};
pub use stream::{SessionState, StreamRegistry, StreamingSession};

pub use confab_protocol as protocol;
