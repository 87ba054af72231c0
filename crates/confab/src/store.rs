//! Chat state store.
//!
//! Single source of truth for what the UI renders: the ordered message
//! list, the active conversation and thread, and the sending/loading/error
//! flags. All writes go through named methods on [`ChatStore`]; there is no
//! way to hand out a mutable reference to the state itself. Readers take
//! [`ChatStore::snapshot`]s and watch the revision counter for changes.

use std::sync::{Arc, RwLock};

use log::{debug, warn};
use serde_json::{Map, Value};
use tokio::sync::watch;

use confab_protocol::{ChatMessage, MessageStatus};

/// Renderable chat state. Cloned out by [`ChatStore::snapshot`].
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    /// Messages in display order.
    pub messages: Vec<ChatMessage>,
    /// Active conversation, once known.
    pub conversation_id: Option<String>,
    /// Active thread, once known.
    pub thread_id: Option<String>,
    /// A send is awaiting its response.
    pub sending: bool,
    /// History is being (re)loaded.
    pub loading: bool,
    /// Last surfaced failure, cleared by the next successful operation.
    pub error: Option<String>,
}

impl ChatState {
    pub fn message(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }
}

/// Partial message update, applied through [`ChatStore::update_message`].
///
/// Only the populated fields change; `metadata` entries are merged over the
/// existing map.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub status: Option<MessageStatus>,
    pub metadata: Map<String, Value>,
}

impl MessagePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_meta_entries(mut self, entries: Map<String, Value>) -> Self {
        self.metadata.extend(entries);
        self
    }
}

/// Handle to the shared chat state. Cheap to clone.
#[derive(Clone)]
pub struct ChatStore {
    state: Arc<RwLock<ChatState>>,
    revision: Arc<watch::Sender<u64>>,
}

impl ChatStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: Arc::new(RwLock::new(ChatState::default())),
            revision: Arc::new(revision),
        }
    }

    /// Append a message to the list.
    ///
    /// Ids are unique within the list; a duplicate is dropped here as the
    /// last line of defense behind the deduplicator.
    pub fn add_message(&self, message: ChatMessage) {
        self.mutate(|state| {
            if state.message(&message.id).is_some() {
                warn!("dropping message with duplicate id {}", message.id);
                return false;
            }
            debug!("adding {} message {}", message.role, message.id);
            state.messages.push(message);
            true
        });
    }

    /// Apply a partial update to one message. Returns false when the id is
    /// not in the list.
    pub fn update_message(&self, id: &str, patch: MessagePatch) -> bool {
        self.mutate(|state| {
            let Some(message) = state.messages.iter_mut().find(|m| m.id == id) else {
                debug!("update for unknown message {id}, skipping");
                return false;
            };
            if let Some(content) = patch.content {
                message.content = content;
            }
            if let Some(status) = patch.status {
                message.status = status;
            }
            if !patch.metadata.is_empty() {
                message.metadata.extend(patch.metadata);
            }
            true
        })
    }

    /// Replace the whole message list. Used by resync; local state is
    /// discarded, not merged.
    pub fn replace_messages(&self, messages: Vec<ChatMessage>) {
        self.mutate(|state| {
            debug!(
                "replacing {} local messages with {} from history",
                state.messages.len(),
                messages.len()
            );
            state.messages = messages;
            true
        });
    }

    pub fn set_conversation_id(&self, id: Option<String>) {
        self.mutate(|state| {
            if state.conversation_id == id {
                return false;
            }
            state.conversation_id = id;
            true
        });
    }

    pub fn set_thread_id(&self, id: Option<String>) {
        self.mutate(|state| {
            if state.thread_id == id {
                return false;
            }
            state.thread_id = id;
            true
        });
    }

    pub fn set_sending(&self, sending: bool) {
        self.mutate(|state| {
            if state.sending == sending {
                return false;
            }
            state.sending = sending;
            true
        });
    }

    pub fn set_loading(&self, loading: bool) {
        self.mutate(|state| {
            if state.loading == loading {
                return false;
            }
            state.loading = loading;
            true
        });
    }

    pub fn set_error(&self, error: Option<String>) {
        self.mutate(|state| {
            if state.error == error {
                return false;
            }
            if let Some(reason) = &error {
                warn!("chat error surfaced: {reason}");
            }
            state.error = error;
            true
        });
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> ChatState {
        self.read(|state| state.clone())
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.read(|state| state.conversation_id.clone())
    }

    pub fn thread_id(&self) -> Option<String> {
        self.read(|state| state.thread_id.clone())
    }

    /// Copy of one message by id.
    pub fn message(&self, id: &str) -> Option<ChatMessage> {
        self.read(|state| state.message(id).cloned())
    }

    pub fn message_count(&self) -> usize {
        self.read(|state| state.messages.len())
    }

    /// Watch the revision counter. It bumps once per effective mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn read<T>(&self, f: impl FnOnce(&ChatState) -> T) -> T {
        match self.state.read() {
            Ok(state) => f(&state),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut ChatState) -> bool) -> bool {
        let changed = match self.state.write() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        };
        if changed {
            self.revision.send_modify(|revision| *revision += 1);
        }
        changed
    }
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}
