//! Canonical wire types for the Confab realtime channel.
//!
//! Everything that crosses the WebSocket boundary is defined here: the
//! message model shared with the persistence layer, the tagged event
//! unions for both directions, and the frame envelope that carries
//! acknowledgement ids. The client crate and any test peer speak through
//! these types only; raw JSON stops at this crate.

pub mod events;
pub mod messages;

pub use events::{ClientEvent, ClientFrame, ProtocolError, SendIds, ServerEvent};
pub use messages::{ChatMessage, MessageStatus, Role};
