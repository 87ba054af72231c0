//! Message history collaborator.
//!
//! Durable storage lives behind a REST endpoint owned by another part of
//! the system. The realtime core needs exactly one operation from it: load
//! everything for a conversation, so a reconnect can replace local state
//! with the server's view.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;

use confab_protocol::ChatMessage;

/// Errors from the history collaborator.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// The request never produced a response.
    #[error("history request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status.
    #[error("history endpoint returned status {status}")]
    Status { status: u16 },

    /// The response body is not a message list.
    #[error("failed to decode history payload: {0}")]
    Decode(String),
}

/// Read access to the durable message store.
#[async_trait]
pub trait MessageHistory: Send + Sync {
    /// Load the full message history of a conversation, oldest first.
    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, HistoryError>;
}

/// History access over the conventional REST surface.
pub struct HttpHistory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHistory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }
}

#[async_trait]
impl MessageHistory for HttpHistory {
    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, HistoryError> {
        let url = format!(
            "{}/conversations/{}/messages",
            self.base_url,
            urlencoding::encode(conversation_id)
        );
        debug!("loading history from {url}");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(HistoryError::Status {
                status: response.status().as_u16(),
            });
        }

        response
            .json::<Vec<ChatMessage>>()
            .await
            .map_err(|e| HistoryError::Decode(e.to_string()))
    }
}

/// Scripted in-memory history for tests and offline runs.
#[derive(Default)]
pub struct StaticHistory {
    conversations: Mutex<HashMap<String, Vec<ChatMessage>>>,
    failing: Mutex<bool>,
}

impl StaticHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the canonical message list for a conversation.
    pub fn insert(&self, conversation_id: impl Into<String>, messages: Vec<ChatMessage>) {
        if let Ok(mut conversations) = self.conversations.lock() {
            conversations.insert(conversation_id.into(), messages);
        }
    }

    /// Make every load fail with a server error until reset.
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut flag) = self.failing.lock() {
            *flag = failing;
        }
    }

    fn is_failing(&self) -> bool {
        self.failing.lock().map(|flag| *flag).unwrap_or(false)
    }
}

#[async_trait]
impl MessageHistory for StaticHistory {
    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, HistoryError> {
        if self.is_failing() {
            return Err(HistoryError::Status { status: 503 });
        }
        let messages = self
            .conversations
            .lock()
            .ok()
            .and_then(|conversations| conversations.get(conversation_id).cloned())
            .unwrap_or_default();
        Ok(messages)
    }
}
