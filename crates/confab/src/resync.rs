//! Reconnection-driven state recovery.
//!
//! The server does not resume streams across connections, and messages
//! delivered while the client was away are simply missing locally. The
//! coordinator restores a consistent view in two moves, always in this
//! order: when the connection drops, every in-flight response is forced
//! into an error state; when the connection is back, the conversation's
//! history is reloaded and replaces the local list wholesale. Merging is
//! deliberately off the table, the server's view wins.

use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::Value;

use confab_protocol::MessageStatus;

use crate::history::MessageHistory;
use crate::store::{ChatStore, MessagePatch};
use crate::stream::StreamRegistry;

/// Error text attached to responses cut off by a connection loss.
pub const INTERRUPTED_STREAM_ERROR: &str = "connection lost during streaming";

pub struct ReconnectCoordinator {
    history: Arc<dyn MessageHistory>,
    store: ChatStore,
}

impl ReconnectCoordinator {
    pub fn new(history: Arc<dyn MessageHistory>, store: ChatStore) -> Self {
        Self { history, store }
    }

    /// The channel left `connected`: invalidate whatever was in flight.
    ///
    /// Chunks from the lost connection can no longer arrive, and a
    /// re-issued response would come with a fresh id. The affected
    /// messages keep their partial content, marked as errored. The sending
    /// flag always clears: a send acknowledged on the lost connection can
    /// no longer produce its response, whether or not the stream had
    /// started.
    pub fn handle_connection_lost(&self, streams: &mut StreamRegistry) {
        let interrupted = streams.fail_open_sessions(INTERRUPTED_STREAM_ERROR);
        for response_id in &interrupted {
            self.store.update_message(
                response_id,
                MessagePatch::new()
                    .with_status(MessageStatus::Error)
                    .with_meta("error", Value::from(INTERRUPTED_STREAM_ERROR)),
            );
        }
        self.store.set_sending(false);
    }

    /// The channel entered `connected`: reload and replace local history.
    ///
    /// Also runs on the first connect, where it doubles as the initial
    /// load. A failed reload surfaces as a store error and is retried on
    /// the next `connected` transition, not in a loop.
    pub async fn handle_connected(&self) {
        self.sync_history().await;
    }

    /// Replace the local message list with the server's view.
    pub async fn sync_history(&self) {
        let Some(conversation_id) = self.store.conversation_id() else {
            debug!("no active conversation, skipping history sync");
            return;
        };

        self.store.set_loading(true);
        match self.history.load_messages(&conversation_id).await {
            Ok(messages) => {
                info!(
                    "synced {} messages for conversation {conversation_id}",
                    messages.len()
                );
                self.store.replace_messages(messages);
                self.store.set_error(None);
            }
            Err(e) => {
                warn!("history sync for conversation {conversation_id} failed: {e}");
                self.store
                    .set_error(Some(format!("failed to reload history: {e}")));
            }
        }
        self.store.set_loading(false);
    }

    /// The reconnection budget is spent; the outage is permanent until the
    /// caller asks for a new connection.
    pub fn handle_failed(&self) {
        self.store
            .set_error(Some("connection failed, no longer retrying".to_string()));
        self.store.set_sending(false);
    }
}
