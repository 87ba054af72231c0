//! Test utilities and common setup.
//!
//! [`TestServer`] is an in-process WebSocket endpoint the tests script
//! frame by frame: accept a connection, read the client's frames, push
//! server events back. Nothing here has protocol opinions beyond framing;
//! each test decides when to acknowledge, stream, or drop the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::Map;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use confab::protocol::{
    ChatMessage, ClientEvent, ClientFrame, MessageStatus, Role, SendIds, ServerEvent,
};
use confab::{ChatState, ChatStore, ClientConfig, ConnectionState};

const WAIT: Duration = Duration::from_secs(5);

/// Client configuration tuned for fast test runs.
pub fn test_client_config(url: impl Into<String>) -> ClientConfig {
    let mut config = ClientConfig::new(url);
    config.channel.base_backoff = Duration::from_millis(10);
    config.channel.max_backoff = Duration::from_millis(50);
    config.channel.ack_timeout = Duration::from_millis(500);
    config.channel.connect_timeout = Duration::from_secs(2);
    config
}

/// A WebSocket URL nothing listens on.
pub fn unused_endpoint() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("ws://127.0.0.1:{port}/chat")
}

/// Poll the store until `predicate` holds, or panic after five seconds.
pub async fn wait_for_store(
    store: &ChatStore,
    what: &str,
    mut predicate: impl FnMut(&ChatState) -> bool,
) {
    let mut revisions = store.subscribe();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if predicate(&store.snapshot()) {
            return;
        }
        tokio::select! {
            changed = revisions.changed() => {
                assert!(changed.is_ok(), "store dropped while waiting for {what}");
            }
            _ = tokio::time::sleep_until(deadline) => {
                panic!("timed out waiting for {what}");
            }
        }
    }
}

/// Wait until the connection reaches `target`, or panic after five seconds.
pub async fn wait_for_state(
    mut states: tokio::sync::watch::Receiver<ConnectionState>,
    target: ConnectionState,
) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if *states.borrow_and_update() == target {
            return;
        }
        tokio::select! {
            changed = states.changed() => {
                assert!(changed.is_ok(), "channel dropped while waiting for {target}");
            }
            _ = tokio::time::sleep_until(deadline) => {
                panic!("timed out waiting for connection state {target}");
            }
        }
    }
}

/// A persisted message the way the history endpoint would return it.
pub fn history_message(id: &str, role: Role, content: &str) -> ChatMessage {
    ChatMessage {
        id: id.to_string(),
        role,
        content: content.to_string(),
        status: MessageStatus::Delivered,
        conversation_id: None,
        thread_id: None,
        created_at: Utc::now(),
        metadata: Map::new(),
    }
}

// ============================================================================
// Scripted server
// ============================================================================

#[derive(Clone)]
struct ServerState {
    conn_tx: mpsc::Sender<ServerConn>,
    connections: Arc<AtomicUsize>,
}

/// An in-process WebSocket server under test control.
pub struct TestServer {
    addr: SocketAddr,
    conn_rx: Mutex<mpsc::Receiver<ServerConn>>,
    connections: Arc<AtomicUsize>,
    serve_handle: JoinHandle<()>,
}

impl TestServer {
    /// Bind an ephemeral port and start serving `/chat`.
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (conn_tx, conn_rx) = mpsc::channel(16);
        let connections = Arc::new(AtomicUsize::new(0));
        let state = ServerState {
            conn_tx,
            connections: connections.clone(),
        };

        let app = Router::new()
            .route("/chat", get(upgrade_handler))
            .with_state(state);
        let serve_handle = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self {
            addr,
            conn_rx: Mutex::new(conn_rx),
            connections,
            serve_handle,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/chat", self.addr)
    }

    /// Wait for the next client connection.
    pub async fn accept(&self) -> ServerConn {
        timeout(WAIT, self.conn_rx.lock().await.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("server stopped accepting")
    }

    /// Total connections seen since spawn.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.serve_handle.abort();
    }
}

async fn upgrade_handler(
    State(state): State<ServerState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    state.connections.fetch_add(1, Ordering::SeqCst);

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(32);
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<ClientFrame>();
    let conn = ServerConn {
        out: out_tx,
        frames: Mutex::new(frame_rx),
    };
    if state.conn_tx.send(conn).await.is_err() {
        return;
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(message) => {
                    if ws_tx.send(message).await.is_err() {
                        break;
                    }
                }
                // Test dropped its handle; close the socket cleanly.
                None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(frame) = ClientFrame::decode(text.as_str()) {
                        if frame_tx.send(frame).is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
}

/// One accepted connection, driven from the test body.
pub struct ServerConn {
    out: mpsc::Sender<Message>,
    frames: Mutex<mpsc::UnboundedReceiver<ClientFrame>>,
}

impl ServerConn {
    pub async fn send_event(&self, event: &ServerEvent) {
        self.send_raw(serde_json::to_string(event).unwrap()).await;
    }

    /// Push a raw text frame, valid or not.
    pub async fn send_raw(&self, raw: impl Into<String>) {
        let _ = self.out.send(Message::Text(raw.into().into())).await;
    }

    pub async fn ack(&self, id: u64) {
        self.send_event(&ServerEvent::Ack { id, error: None }).await;
    }

    pub async fn ack_error(&self, id: u64, error: &str) {
        self.send_event(&ServerEvent::Ack {
            id,
            error: Some(error.to_string()),
        })
        .await;
    }

    /// Close the socket from the server side.
    pub async fn close(&self) {
        let _ = self.out.send(Message::Close(None)).await;
    }

    /// Next decoded frame from the client.
    pub async fn next_frame(&self) -> ClientFrame {
        timeout(WAIT, self.frames.lock().await.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("connection closed")
    }

    /// Next `message:send`, skipping keepalive replies. Returns the ack id
    /// the client expects an answer for, plus the submitted content and ids.
    pub async fn next_send(&self) -> (u64, String, SendIds) {
        loop {
            let frame = self.next_frame().await;
            match frame.event {
                ClientEvent::MessageSend {
                    content, metadata, ..
                } => {
                    let ack = frame.ack.expect("message:send carried no ack id");
                    return (ack, content, metadata);
                }
                ClientEvent::Pong => continue,
                other => panic!("unexpected client event: {other:?}"),
            }
        }
    }

    /// Run a whole scripted response: ack the pending send, then stream
    /// `chunks` and complete.
    pub async fn stream_response(&self, ack_id: u64, response_id: &str, chunks: &[&str]) {
        self.ack(ack_id).await;
        self.send_event(&ServerEvent::StreamStart {
            response_id: response_id.to_string(),
            conversation_id: None,
            thread_id: None,
        })
        .await;
        for (seq, chunk) in chunks.iter().enumerate() {
            self.send_event(&ServerEvent::StreamChunk {
                response_id: response_id.to_string(),
                chunk: chunk.to_string(),
                seq: seq as u64,
            })
            .await;
        }
        self.send_event(&ServerEvent::StreamComplete {
            response_id: response_id.to_string(),
            content: None,
            metadata: Map::new(),
        })
        .await;
    }
}
