//! Chat client facade.
//!
//! Wires the transport channel, deduplicator, stream registry, store and
//! reconnect coordinator together, and runs the single event pump that
//! applies everything the server pushes. Consumers hold a [`ChatClient`]
//! (usually through the process-wide accessor) and otherwise only read the
//! store.

use std::sync::Arc;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use confab_protocol::{ChatMessage, ClientEvent, MessageStatus, SendIds, ServerEvent};

use crate::channel::{Channel, ChannelConfig, ChannelItem, ConnectionState};
use crate::dedup::{Deduplicator, DEFAULT_DEDUP_CAPACITY};
use crate::error::{ApplicationError, ClientError};
use crate::history::MessageHistory;
use crate::resync::ReconnectCoordinator;
use crate::store::{ChatStore, MessagePatch};
use crate::stream::StreamRegistry;

/// Configuration for the chat client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Transport channel settings.
    pub channel: ChannelConfig,
    /// Size of the deduplication window.
    pub dedup_capacity: usize,
    /// Reload history after every `connected` transition.
    pub resync_on_connect: bool,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            channel: ChannelConfig::new(url),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            resync_on_connect: true,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            resync_on_connect: true,
        }
    }
}

/// Ids allocated for one accepted send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Id of the user message.
    pub request_id: String,
    /// Id the assistant response will stream under.
    pub response_id: String,
}

/// The realtime chat client.
pub struct ChatClient {
    channel: Channel,
    store: ChatStore,
    dedup: Arc<Mutex<Deduplicator>>,
    coordinator: Arc<ReconnectCoordinator>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    /// Build a client and start its event pump.
    ///
    /// The pump runs for the client's lifetime; call [`Self::shutdown`] for
    /// a tidy teardown. No connection is opened until [`Self::connect`].
    pub fn new(config: ClientConfig, history: Arc<dyn MessageHistory>) -> Self {
        let channel = Channel::new(config.channel.clone());
        let store = ChatStore::new();
        let dedup = Arc::new(Mutex::new(Deduplicator::new(config.dedup_capacity)));
        let coordinator = Arc::new(ReconnectCoordinator::new(history, store.clone()));

        let pump = EventPump {
            feed: channel.subscribe(),
            store: store.clone(),
            dedup: Arc::clone(&dedup),
            coordinator: Arc::clone(&coordinator),
            streams: StreamRegistry::new(),
            last_state: channel.state(),
            resync_on_connect: config.resync_on_connect,
        };
        let pump_handle = tokio::spawn(pump.run());

        Self {
            channel,
            store,
            dedup,
            coordinator,
            pump: Mutex::new(Some(pump_handle)),
        }
    }

    /// Open the connection. Idempotent; all callers share one channel.
    pub async fn connect(&self) {
        self.channel.connect().await;
    }

    /// Close the connection. The client stays usable; `connect` starts a
    /// fresh lifecycle.
    pub async fn disconnect(&self) {
        self.channel.disconnect().await;
    }

    /// Close the connection and stop the event pump.
    ///
    /// Terminal: with no pump left to apply server events, the client
    /// refuses further sends. Build a fresh client to start over.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        if let Some(handle) = self.pump.lock().await.take() {
            handle.abort();
        }
    }

    async fn is_shut_down(&self) -> bool {
        self.pump.lock().await.is_none()
    }

    pub fn state(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.channel.state_changes()
    }

    /// Wait until the channel reports `connected`.
    pub async fn wait_until_connected(
        &self,
        deadline: std::time::Duration,
    ) -> Result<(), ClientError> {
        self.channel
            .wait_until_connected(deadline)
            .await
            .map_err(Into::into)
    }

    /// The shared state store.
    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    /// Switch to a conversation and load its history immediately.
    pub async fn select_conversation(&self, conversation_id: impl Into<String>) {
        self.store
            .set_conversation_id(Some(conversation_id.into()));
        self.coordinator.sync_history().await;
    }

    /// Submit a user message.
    ///
    /// The message appears in the store right away in `sending` state, then
    /// moves to `sent` once the server acknowledges the frame, or to
    /// `error` with the failure recorded in its metadata. The returned
    /// receipt names the response id the reply will stream under.
    pub async fn send_message(
        &self,
        content: impl Into<String>,
    ) -> Result<SendReceipt, ClientError> {
        if self.is_shut_down().await {
            return Err(ApplicationError::ClientClosed.into());
        }
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ApplicationError::EmptyMessage.into());
        }

        let conversation_id = self.store.conversation_id();
        let response_id = Uuid::new_v4().to_string();

        let mut message = ChatMessage::user(&content);
        message.conversation_id = conversation_id.clone();
        message.thread_id = self.store.thread_id();
        let request_id = message.id.clone();

        // Track before adding so the server's echo of this message is
        // suppressed as a duplicate.
        self.dedup.lock().await.check_and_track(&request_id);
        self.store.add_message(message);
        self.store.set_sending(true);
        self.store.set_error(None);

        let event = ClientEvent::MessageSend {
            content,
            conversation_id,
            metadata: SendIds {
                request_id: request_id.clone(),
                response_id: response_id.clone(),
            },
        };

        match self.channel.request(event).await {
            Ok(()) => {
                debug!("message {request_id} accepted, response will be {response_id}");
                self.store
                    .update_message(&request_id, MessagePatch::new().with_status(MessageStatus::Sent));
                Ok(SendReceipt {
                    request_id,
                    response_id,
                })
            }
            Err(e) => {
                warn!("message {request_id} failed to send: {e}");
                self.store.update_message(
                    &request_id,
                    MessagePatch::new()
                        .with_status(MessageStatus::Error)
                        .with_meta("error", Value::from(e.to_string())),
                );
                self.store.set_sending(false);
                Err(e.into())
            }
        }
    }

    /// Ask the server to stop an in-flight response.
    ///
    /// Fire and forget: the response stays live until the server confirms
    /// with a `stream:error` for the same id.
    pub async fn cancel_response(&self, response_id: &str) -> Result<(), ClientError> {
        if self.is_shut_down().await {
            return Err(ApplicationError::ClientClosed.into());
        }
        self.channel
            .send(ClientEvent::MessageCancel {
                response_id: response_id.to_string(),
            })
            .await
            .map_err(Into::into)
    }
}

// ============================================================================
// Event pump
// ============================================================================

/// Applies the channel's ordered feed to the local components.
///
/// Single consumer by construction: lifecycle transitions and protocol
/// events arrive in one stream, so "streams failed before resync" style
/// ordering holds without cross-task coordination.
struct EventPump {
    feed: broadcast::Receiver<ChannelItem>,
    store: ChatStore,
    dedup: Arc<Mutex<Deduplicator>>,
    coordinator: Arc<ReconnectCoordinator>,
    streams: StreamRegistry,
    last_state: ConnectionState,
    resync_on_connect: bool,
}

impl EventPump {
    async fn run(mut self) {
        debug!("chat event pump started");
        loop {
            match self.feed.recv().await {
                Ok(ChannelItem::State(state)) => self.on_state(state).await,
                Ok(ChannelItem::Event(event)) => self.on_event(event).await,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!("event pump lagged, {count} items dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("chat event pump ended");
    }

    async fn on_state(&mut self, state: ConnectionState) {
        let previous = self.last_state;
        self.last_state = state;

        match state {
            ConnectionState::Connected => {
                if self.resync_on_connect {
                    self.coordinator.handle_connected().await;
                }
            }
            ConnectionState::Reconnecting | ConnectionState::Disconnected => {
                if previous == ConnectionState::Connected {
                    self.coordinator.handle_connection_lost(&mut self.streams);
                }
            }
            ConnectionState::Failed => {
                if previous == ConnectionState::Connected {
                    self.coordinator.handle_connection_lost(&mut self.streams);
                }
                self.coordinator.handle_failed();
            }
            ConnectionState::Connecting => {}
        }
    }

    async fn on_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected => debug!("server hello received"),

            ServerEvent::StreamStart {
                response_id,
                conversation_id,
                thread_id,
            } => {
                self.adopt_ids(conversation_id.as_deref(), thread_id.as_deref());
                self.streams.start(&response_id);
                self.ensure_response_message(&response_id).await;
            }

            ServerEvent::StreamChunk {
                response_id,
                chunk,
                seq,
            } => {
                if self
                    .dedup
                    .lock()
                    .await
                    .check_and_track_chunk(&response_id, seq)
                {
                    debug!("duplicate chunk seq {seq} for response {response_id}, skipping");
                    return;
                }
                self.ensure_response_message(&response_id).await;
                if let Some(content) = self.streams.apply_chunk(&response_id, &chunk, seq) {
                    self.store.update_message(
                        &response_id,
                        MessagePatch::new()
                            .with_content(content)
                            .with_status(MessageStatus::Streaming),
                    );
                }
            }

            ServerEvent::StreamComplete {
                response_id,
                content,
                metadata,
            } => {
                if let Some(final_content) = self.streams.complete(&response_id, content) {
                    info!("response {response_id} complete ({} chars)", final_content.len());
                    self.store.update_message(
                        &response_id,
                        MessagePatch::new()
                            .with_content(final_content)
                            .with_status(MessageStatus::Sent)
                            .with_meta_entries(metadata),
                    );
                    self.store.set_sending(false);
                }
            }

            ServerEvent::StreamError { response_id, error } => {
                if self.streams.error(&response_id, &error) {
                    self.store.update_message(
                        &response_id,
                        MessagePatch::new()
                            .with_status(MessageStatus::Error)
                            .with_meta("error", Value::from(error)),
                    );
                    self.store.set_sending(false);
                }
            }

            ServerEvent::MessageNew { message } => {
                if self.dedup.lock().await.check_and_track(&message.id) {
                    debug!("suppressing duplicate message {}", message.id);
                    return;
                }
                self.adopt_ids(
                    message.conversation_id.as_deref(),
                    message.thread_id.as_deref(),
                );
                self.store.add_message(message);
            }

            // Resolved inside the channel, never forwarded here.
            ServerEvent::Ack { .. } | ServerEvent::Ping => {}
        }
    }

    /// Create the placeholder assistant message for a response, once.
    ///
    /// Tracking the response id also suppresses the later `message:new`
    /// echo of the finished message.
    async fn ensure_response_message(&mut self, response_id: &str) {
        if self.dedup.lock().await.check_and_track(response_id) {
            return;
        }
        let mut message = ChatMessage::assistant_pending(response_id);
        message.conversation_id = self.store.conversation_id();
        message.thread_id = self.store.thread_id();
        self.store.add_message(message);
    }

    /// Adopt server-assigned conversation and thread ids on first sight.
    fn adopt_ids(&self, conversation_id: Option<&str>, thread_id: Option<&str>) {
        if let Some(id) = conversation_id {
            if self.store.conversation_id().is_none() {
                info!("adopting conversation {id}");
                self.store.set_conversation_id(Some(id.to_string()));
            }
        }
        if let Some(id) = thread_id {
            if self.store.thread_id().is_none() {
                self.store.set_thread_id(Some(id.to_string()));
            }
        }
    }
}

// ============================================================================
// Process-wide client instance
// ============================================================================

static GLOBAL_CLIENT: Lazy<RwLock<Option<Arc<ChatClient>>>> = Lazy::new(|| RwLock::new(None));

/// Install the process-wide client, or return the one already installed.
///
/// Later calls with a different configuration do not replace a live
/// client; use [`reset_global`] first when that is intended.
pub async fn init_global(config: ClientConfig, history: Arc<dyn MessageHistory>) -> Arc<ChatClient> {
    let mut slot = GLOBAL_CLIENT.write().await;
    if let Some(existing) = slot.as_ref() {
        debug!("global chat client already installed, reusing it");
        return Arc::clone(existing);
    }
    let client = Arc::new(ChatClient::new(config, history));
    *slot = Some(Arc::clone(&client));
    client
}

/// The process-wide client, when installed.
pub async fn global() -> Option<Arc<ChatClient>> {
    GLOBAL_CLIENT.read().await.as_ref().map(Arc::clone)
}

/// Tear down the process-wide client. Outstanding handles keep working;
/// the next [`init_global`] builds a fresh instance.
pub async fn reset_global() {
    let client = GLOBAL_CLIENT.write().await.take();
    if let Some(client) = client {
        client.shutdown().await;
    }
}
