//! Transport channel.
//!
//! One WebSocket connection per client, owned by a background runner task
//! that drives the connect/reconnect lifecycle:
//!
//! ```text
//!   connect()                      session ends unexpectedly
//!      |                                     |
//!      v                                     v
//!  connecting -> connected <- - - - -  reconnecting --(budget spent)--> failed
//!      |             |                       ^
//!      |             +--- frames flow ---+   | backoff with jitter
//!      +-------------------------------------+
//!
//!   disconnect() from any state -> disconnected
//! ```
//!
//! Consumers never touch the socket. They watch [`Channel::state_changes`],
//! subscribe to the ordered feed of [`ChannelItem`]s and push frames through
//! [`Channel::send`] / [`Channel::request`].

mod backoff;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use confab_protocol::{ClientEvent, ClientFrame, ServerEvent};

use crate::error::TransportError;

/// Maximum number of reconnection attempts before giving up.
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Base delay for exponential backoff (milliseconds).
const DEFAULT_BASE_BACKOFF_MS: u64 = 500;

/// Maximum backoff delay (milliseconds).
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// How long to wait for a frame acknowledgement.
const DEFAULT_ACK_TIMEOUT_SECS: u64 = 10;

/// Deadline for the TCP + WebSocket handshake of one attempt.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Keepalive - if no traffic for this long, recycle the connection.
const DEFAULT_KEEPALIVE_TIMEOUT_SECS: u64 = 60;

/// Buffer size for the inbound feed broadcast channel.
const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

/// Buffer size for the outbound frame queue.
const DEFAULT_SEND_BUFFER_SIZE: usize = 64;

/// Grace period for a clean close before the runner is aborted.
const SHUTDOWN_GRACE_MS: u64 = 500;

/// Connection state of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Configuration for the transport channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:4100/chat`.
    pub url: String,
    /// Reconnection attempts before entering `failed`.
    pub max_reconnect_attempts: u32,
    /// Base delay for exponential backoff.
    pub base_backoff: Duration,
    /// Ceiling for the backoff delay, jitter included.
    pub max_backoff: Duration,
    /// Bounded wait for `ack` replies on [`Channel::request`].
    pub ack_timeout: Duration,
    /// Deadline for one connection attempt.
    pub connect_timeout: Duration,
    /// Recycle the connection after this much silence.
    pub keepalive_timeout: Duration,
    /// Buffer size for the inbound feed broadcast channel.
    pub event_buffer_size: usize,
    /// Buffer size for the outbound frame queue.
    pub send_buffer_size: usize,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_backoff: Duration::from_millis(DEFAULT_BASE_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            ack_timeout: Duration::from_secs(DEFAULT_ACK_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            keepalive_timeout: Duration::from_secs(DEFAULT_KEEPALIVE_TIMEOUT_SECS),
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new("ws://127.0.0.1:4100/chat")
    }
}

/// One item from the channel's subscriber feed.
///
/// Lifecycle transitions are interleaved with protocol events in arrival
/// order, so a subscriber that sees `stream:chunk` followed by
/// `State(Reconnecting)` knows the chunk predates the outage.
#[derive(Debug, Clone)]
pub enum ChannelItem {
    /// A decoded protocol event.
    Event(ServerEvent),
    /// The channel entered a new connection state.
    State(ConnectionState),
}

type AckSender = oneshot::Sender<Result<(), String>>;
type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How one connection session ended.
enum SessionEnd {
    /// `disconnect` was requested.
    Shutdown,
    /// The connection died; the runner should reconnect.
    Lost(String),
}

/// Handle on the background runner, guarded so `connect` stays idempotent.
#[derive(Default)]
struct RunnerSlot {
    handle: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

struct ChannelInner {
    config: ChannelConfig,
    state_tx: watch::Sender<ConnectionState>,
    feed_tx: broadcast::Sender<ChannelItem>,
    /// Outbound frame queue of the live session; `None` between sessions.
    outbound: RwLock<Option<mpsc::Sender<WsMessage>>>,
    /// Pending acknowledgements, keyed by frame id.
    pending_acks: RwLock<HashMap<u64, AckSender>>,
    /// Counter for generating frame ids.
    ack_counter: Mutex<u64>,
    runner: Mutex<RunnerSlot>,
}

impl ChannelInner {
    /// Record a state transition and publish it on both feeds.
    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!("chat channel state: {state} -> {next}");
            *state = next;
            let _ = self.feed_tx.send(ChannelItem::State(next));
            true
        });
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Wake every pending acknowledgement waiter with a closed channel.
    async fn fail_pending_acks(&self, reason: &str) {
        let mut pending = self.pending_acks.write().await;
        if !pending.is_empty() {
            debug!("dropping {} pending acks: {reason}", pending.len());
        }
        pending.clear();
    }

    /// Drop the live socket so the runner takes its reconnect path.
    async fn recycle(&self, reason: &str) {
        warn!("recycling chat connection: {reason}");
        self.outbound.write().await.take();
    }

    /// Decode one inbound text frame and route it.
    ///
    /// Malformed frames are logged and dropped; they never end the session.
    async fn handle_frame(&self, raw: &str) {
        let event = match ServerEvent::decode(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping inbound frame: {e}");
                return;
            }
        };

        match event {
            ServerEvent::Ack { id, error } => {
                let waiter = self.pending_acks.write().await.remove(&id);
                match waiter {
                    Some(tx) => {
                        let outcome = match error {
                            None => Ok(()),
                            Some(reason) => Err(reason),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => debug!("ack for unknown frame id {id}"),
                }
            }
            ServerEvent::Ping => {
                if let Err(e) = self.enqueue(ClientFrame::new(ClientEvent::Pong)).await {
                    debug!("could not answer ping: {e}");
                }
            }
            other => {
                let _ = self.feed_tx.send(ChannelItem::Event(other));
            }
        }
    }

    /// Queue one frame on the live session.
    async fn enqueue(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let encoded = frame
            .encode()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        let tx = self.outbound.read().await.clone();
        match tx {
            Some(tx) => tx
                .send(WsMessage::Text(encoded.into()))
                .await
                .map_err(|_| TransportError::NotConnected),
            None => Err(TransportError::NotConnected),
        }
    }
}

/// Handle to the transport channel. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn new(config: ChannelConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (feed_tx, _) = broadcast::channel(config.event_buffer_size);
        Self {
            inner: Arc::new(ChannelInner {
                config,
                state_tx,
                feed_tx,
                outbound: RwLock::new(None),
                pending_acks: RwLock::new(HashMap::new()),
                ack_counter: Mutex::new(0),
                runner: Mutex::new(RunnerSlot::default()),
            }),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Start the connection runner.
    ///
    /// Idempotent: while a runner is alive this is a no-op, so concurrent
    /// callers always share the single underlying connection. After
    /// `disconnect` or a `failed` state a fresh runner is started.
    pub async fn connect(&self) {
        let mut slot = self.inner.runner.lock().await;
        if let Some(handle) = &slot.handle {
            if !handle.is_finished() {
                debug!(
                    "connect() while channel is {}, reusing existing connection",
                    self.state()
                );
                return;
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        slot.handle = Some(tokio::spawn(run_channel(inner, shutdown_rx)));
        slot.shutdown = Some(shutdown_tx);
    }

    /// Stop the runner and close the connection.
    ///
    /// Cancels any in-progress backoff wait; the channel ends up
    /// `disconnected` no matter where the runner was.
    pub async fn disconnect(&self) {
        let mut slot = self.inner.runner.lock().await;
        if let Some(tx) = slot.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(mut handle) = slot.handle.take() {
            let grace = Duration::from_millis(SHUTDOWN_GRACE_MS);
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.fail_pending_acks("channel closed").await;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to the ordered feed of events and state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelItem> {
        self.inner.feed_tx.subscribe()
    }

    /// Send one event without waiting for acknowledgement.
    pub async fn send(&self, event: ClientEvent) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.inner.enqueue(ClientFrame::new(event)).await
    }

    /// Send one event and wait for the server's acknowledgement.
    ///
    /// A missing ack within the configured deadline is treated as a dead
    /// connection: the socket is recycled and the caller gets
    /// [`TransportError::AckTimeout`].
    pub async fn request(&self, event: ClientEvent) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        let id = {
            let mut counter = self.inner.ack_counter.lock().await;
            *counter += 1;
            *counter
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner.pending_acks.write().await.insert(id, ack_tx);

        if let Err(e) = self.inner.enqueue(ClientFrame::with_ack(event, id)).await {
            self.inner.pending_acks.write().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.config.ack_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(TransportError::Rejected(reason)),
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Err(_) => {
                self.inner.pending_acks.write().await.remove(&id);
                self.inner.recycle("acknowledgement timeout").await;
                Err(TransportError::AckTimeout(self.inner.config.ack_timeout))
            }
        }
    }

    /// Wait until the channel is `connected`.
    ///
    /// Fails fast with [`TransportError::RetriesExhausted`] when the channel
    /// reaches `failed` first.
    pub async fn wait_until_connected(&self, deadline: Duration) -> Result<(), TransportError> {
        let mut states = self.inner.state_tx.subscribe();
        let attempts = self.inner.config.max_reconnect_attempts;
        let wait = async move {
            loop {
                match *states.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Failed => {
                        return Err(TransportError::RetriesExhausted { attempts });
                    }
                    _ => {}
                }
                if states.changed().await.is_err() {
                    return Err(TransportError::Closed);
                }
            }
        };
        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| TransportError::ConnectTimeout)?
    }
}

// ============================================================================
// Connection runner
// ============================================================================

/// Drive the connection lifecycle until shutdown or budget exhaustion.
async fn run_channel(inner: Arc<ChannelInner>, mut shutdown: watch::Receiver<bool>) {
    let mut attempt = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }

        if attempt > 0 {
            if attempt > inner.config.max_reconnect_attempts {
                error!(
                    "chat channel exceeded {} reconnect attempts, giving up",
                    inner.config.max_reconnect_attempts
                );
                inner.set_state(ConnectionState::Failed);
                inner.fail_pending_acks("connection failed").await;
                return;
            }

            inner.set_state(ConnectionState::Reconnecting);
            let delay =
                backoff::delay_for_attempt(attempt, inner.config.base_backoff, inner.config.max_backoff);
            info!("reconnecting to {} in {delay:?} (attempt {attempt})", inner.config.url);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        } else {
            inner.set_state(ConnectionState::Connecting);
        }

        match establish(&inner.config).await {
            Err(e) => {
                attempt += 1;
                warn!("chat channel connect failed (attempt {attempt}): {e}");
            }
            Ok(socket) => {
                attempt = 0;
                info!("chat channel connected to {}", inner.config.url);
                inner.set_state(ConnectionState::Connected);

                match drive_session(&inner, socket, &mut shutdown).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost(reason) => {
                        warn!("chat connection lost: {reason}");
                        attempt = 1;
                    }
                }
            }
        }
    }

    inner.set_state(ConnectionState::Disconnected);
    inner.fail_pending_acks("channel closed").await;
}

/// Open one WebSocket connection within the configured deadline.
async fn establish(config: &ChannelConfig) -> Result<Socket, TransportError> {
    match tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str())).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(e)) => Err(TransportError::Handshake(e.to_string())),
        Err(_) => Err(TransportError::Handshake(format!(
            "no handshake within {:?}",
            config.connect_timeout
        ))),
    }
}

/// Pump one established connection until it ends.
async fn drive_session(
    inner: &Arc<ChannelInner>,
    socket: Socket,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(inner.config.send_buffer_size);
    *inner.outbound.write().await = Some(outbound_tx);

    // Writer task: drains the queue, then closes the socket.
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.send(WsMessage::Close(None)).await;
    });

    let keepalive = inner.config.keepalive_timeout;
    let mut last_traffic = tokio::time::Instant::now();

    let end = loop {
        tokio::select! {
            message = ws_rx.next() => {
                last_traffic = tokio::time::Instant::now();
                match message {
                    Some(Ok(WsMessage::Text(text))) => inner.handle_frame(text.as_str()).await,
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let tx = inner.outbound.read().await.clone();
                        if let Some(tx) = tx {
                            let _ = tx.send(WsMessage::Pong(payload)).await;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Binary(_))) => debug!("ignoring binary frame"),
                    Some(Ok(WsMessage::Close(_))) => {
                        break SessionEnd::Lost("server closed the connection".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break SessionEnd::Lost(format!("socket error: {e}")),
                    None => break SessionEnd::Lost("socket stream ended".to_string()),
                }
            }
            _ = tokio::time::sleep_until(last_traffic + keepalive) => {
                break SessionEnd::Lost(format!("no traffic for {keepalive:?}"));
            }
            result = &mut writer => {
                // The writer only ends early when the socket rejects a frame
                // or the queue was recycled out from under it.
                let reason = match result {
                    Ok(()) => "outbound queue closed".to_string(),
                    Err(e) => format!("writer task failed: {e}"),
                };
                break SessionEnd::Lost(reason);
            }
            _ = shutdown.changed() => break SessionEnd::Shutdown,
        }
    };

    inner.outbound.write().await.take();
    match &end {
        // Let the writer drain and send its Close frame.
        SessionEnd::Shutdown => {
            let grace = Duration::from_millis(SHUTDOWN_GRACE_MS);
            if tokio::time::timeout(grace, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        SessionEnd::Lost(_) => writer.abort(),
    }
    inner.fail_pending_acks("connection lost").await;

    end
}
