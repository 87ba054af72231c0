//! Client integration tests.
//!
//! Each test drives a real `ChatClient` against the scripted WebSocket
//! server from `common`, so the channel, deduplication, streaming and
//! resync layers are exercised together the way a frontend would hit them.
//!
//! `send_message` does not resolve until the server acknowledges the
//! frame, so sends run as background tasks while the test scripts the
//! server side.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Map;
use tokio::task::JoinHandle;

use confab::protocol::{ClientEvent, MessageStatus, Role, ServerEvent};
use confab::{
    ChatClient, ClientError, ConnectionState, SendReceipt, StaticHistory, TransportError,
};

mod common;
use common::{
    TestServer, history_message, test_client_config, unused_endpoint, wait_for_state,
    wait_for_store,
};

fn test_client(url: impl Into<String>) -> (Arc<ChatClient>, Arc<StaticHistory>) {
    let history = Arc::new(StaticHistory::new());
    let client = Arc::new(ChatClient::new(test_client_config(url), history.clone()));
    (client, history)
}

fn send_in_background(
    client: &Arc<ChatClient>,
    content: &str,
) -> JoinHandle<Result<SendReceipt, ClientError>> {
    let client = client.clone();
    let content = content.to_string();
    tokio::spawn(async move { client.send_message(content).await })
}

/// Test the happy path: send a message, stream the response in two chunks,
/// and observe the assembled message settle in the store.
#[tokio::test]
async fn test_send_receives_streamed_response() {
    let server = TestServer::spawn().await;
    let (client, _history) = test_client(server.url());

    client.connect().await;
    let conn = server.accept().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    let send = send_in_background(&client, "What is the weather?");
    let (ack, content, ids) = conn.next_send().await;
    assert_eq!(content, "What is the weather?");

    conn.stream_response(ack, &ids.response_id, &["Hi", " there"])
        .await;
    let receipt = send.await.unwrap().unwrap();
    assert_eq!(receipt.response_id, ids.response_id);

    let store = client.store().clone();
    wait_for_store(&store, "streamed response to settle", |state| {
        state
            .message(&receipt.response_id)
            .is_some_and(|m| m.status == MessageStatus::Sent)
    })
    .await;

    let response = store.message(&receipt.response_id).unwrap();
    assert_eq!(response.content, "Hi there");
    assert_eq!(response.role, Role::Assistant);

    let request = store.message(&receipt.request_id).unwrap();
    assert_eq!(request.status, MessageStatus::Sent);

    wait_for_store(&store, "sending flag to clear", |state| !state.sending).await;
    client.shutdown().await;
}

/// Test that a replayed chunk sequence number does not duplicate content.
#[tokio::test]
async fn test_duplicate_chunk_dropped() {
    let server = TestServer::spawn().await;
    let (client, _history) = test_client(server.url());

    client.connect().await;
    let conn = server.accept().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    let send = send_in_background(&client, "hello");
    let (ack, _, ids) = conn.next_send().await;
    conn.ack(ack).await;
    let receipt = send.await.unwrap().unwrap();

    let chunk = |seq: u64, text: &str| ServerEvent::StreamChunk {
        response_id: ids.response_id.clone(),
        chunk: text.to_string(),
        seq,
    };
    conn.send_event(&chunk(0, "Hi")).await;
    conn.send_event(&chunk(1, " there")).await;
    // Delivered twice; the second copy must be ignored.
    conn.send_event(&chunk(1, " there")).await;
    conn.send_event(&ServerEvent::StreamComplete {
        response_id: ids.response_id.clone(),
        content: None,
        metadata: Map::new(),
    })
    .await;

    let store = client.store().clone();
    wait_for_store(&store, "response to settle", |state| {
        state
            .message(&receipt.response_id)
            .is_some_and(|m| m.status == MessageStatus::Sent)
    })
    .await;

    assert_eq!(
        store.message(&receipt.response_id).unwrap().content,
        "Hi there"
    );
    client.shutdown().await;
}

/// Test that repeated connect calls share one underlying connection.
#[tokio::test]
async fn test_connect_is_idempotent() {
    let server = TestServer::spawn().await;
    let (client, _history) = test_client(server.url());

    client.connect().await;
    client.connect().await;
    client.connect().await;

    let _conn = server.accept().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connection_count(), 1);
    client.shutdown().await;
}

/// Test that a missing acknowledgement times the send out, marks the
/// message failed, and recycles the connection.
#[tokio::test]
async fn test_ack_timeout_recycles_connection() {
    let server = TestServer::spawn().await;
    let (client, _history) = test_client(server.url());

    client.connect().await;
    let conn = server.accept().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    // Swallow the frame without answering.
    let send = send_in_background(&client, "anyone there?");
    let _frame = conn.next_frame().await;

    let err = send.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::AckTimeout(_))
    ));
    assert!(err.is_retryable());

    let store = client.store().clone();
    wait_for_store(&store, "message to be marked failed", |state| {
        state
            .messages
            .first()
            .is_some_and(|m| m.status == MessageStatus::Error)
    })
    .await;

    // The channel gives up on the silent socket and dials again.
    let _second = server.accept().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(server.connection_count(), 2);
    client.shutdown().await;
}

/// Test that a server-side rejection surfaces on the message.
#[tokio::test]
async fn test_server_rejection_marks_message_error() {
    let server = TestServer::spawn().await;
    let (client, _history) = test_client(server.url());

    client.connect().await;
    let conn = server.accept().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    let send = send_in_background(&client, "too spicy");
    let (ack, _, _) = conn.next_send().await;
    conn.ack_error(ack, "quota exceeded").await;

    let err = send.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::Rejected(_))
    ));
    assert!(!err.is_retryable());

    let store = client.store().clone();
    wait_for_store(&store, "rejection to reach the store", |state| {
        state
            .messages
            .first()
            .is_some_and(|m| m.status == MessageStatus::Error)
    })
    .await;

    let message = store.snapshot().messages.first().cloned().unwrap();
    assert!(message.meta_str("error").unwrap().contains("quota exceeded"));
    assert!(!store.snapshot().sending);

    // A rejection is a server answer, not a transport fault; the
    // connection stays up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connection_count(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);
    client.shutdown().await;
}

/// Test that losing the connection mid-stream terminalizes the response
/// with the interruption error before any resync runs.
#[tokio::test]
async fn test_connection_loss_fails_streaming_response() {
    let server = TestServer::spawn().await;
    let (client, history) = test_client(server.url());
    // Keep resync from replacing the store so the failure stays observable.
    history.set_failing(true);

    client.select_conversation("conv-1").await;
    client.connect().await;
    let conn = server.accept().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    let send = send_in_background(&client, "stream this");
    let (ack, _, ids) = conn.next_send().await;
    conn.ack(ack).await;
    let receipt = send.await.unwrap().unwrap();

    conn.send_event(&ServerEvent::StreamStart {
        response_id: ids.response_id.clone(),
        conversation_id: None,
        thread_id: None,
    })
    .await;
    conn.send_event(&ServerEvent::StreamChunk {
        response_id: ids.response_id.clone(),
        chunk: "Hi".to_string(),
        seq: 0,
    })
    .await;

    let store = client.store().clone();
    wait_for_store(&store, "first chunk to land", |state| {
        state
            .message(&receipt.response_id)
            .is_some_and(|m| m.content == "Hi")
    })
    .await;

    conn.close().await;

    wait_for_store(&store, "interrupted stream to fail", |state| {
        state
            .message(&receipt.response_id)
            .is_some_and(|m| m.status == MessageStatus::Error)
    })
    .await;

    let response = store.message(&receipt.response_id).unwrap();
    assert_eq!(
        response.meta_str("error"),
        Some("connection lost during streaming")
    );
    // Partial content is kept for display alongside the error.
    assert_eq!(response.content, "Hi");
    assert!(!store.snapshot().sending);

    // The reconnect still happened; only the history reload failed.
    let _second = server.accept().await;
    wait_for_store(&store, "resync failure to surface", |state| {
        state.error.is_some()
    })
    .await;
    client.shutdown().await;
}

/// Test that a send acknowledged just before the connection drops does not
/// leave the sending flag raised: no stream ever opened, so the loss
/// handling has to clear it.
#[tokio::test]
async fn test_connection_loss_after_ack_clears_sending() {
    let server = TestServer::spawn().await;
    let (client, _history) = test_client(server.url());

    client.connect().await;
    let conn = server.accept().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    let send = send_in_background(&client, "hello?");
    let (ack, _, _) = conn.next_send().await;
    conn.ack(ack).await;
    let receipt = send.await.unwrap().unwrap();

    let store = client.store().clone();
    assert!(store.snapshot().sending);

    // The server dies before stream:start for the pending response.
    conn.close().await;
    let _second = server.accept().await;

    wait_for_store(&store, "sending flag to clear", |state| !state.sending).await;
    // The acknowledged user message is untouched by the loss.
    assert_eq!(
        store.message(&receipt.request_id).unwrap().status,
        MessageStatus::Sent
    );
    client.shutdown().await;
}

/// Test that every reconnect replaces local history with the server's
/// copy instead of merging into it.
#[tokio::test]
async fn test_reconnect_replaces_history() {
    let server = TestServer::spawn().await;
    let (client, history) = test_client(server.url());
    history.insert(
        "conv-1",
        vec![history_message("m-1", Role::User, "earlier message")],
    );

    client.select_conversation("conv-1").await;
    let store = client.store().clone();
    assert_eq!(store.message_count(), 1);

    client.connect().await;
    let conn = server.accept().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();
    // Let the on-connect resync finish before adding local messages.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A full round trip leaves local-only messages in the store.
    let send = send_in_background(&client, "newest");
    let (ack, _, ids) = conn.next_send().await;
    conn.stream_response(ack, &ids.response_id, &["ok"]).await;
    let receipt = send.await.unwrap().unwrap();

    wait_for_store(&store, "response to settle", |state| {
        state
            .message(&receipt.response_id)
            .is_some_and(|m| m.status == MessageStatus::Sent)
    })
    .await;
    assert_eq!(store.message_count(), 3);

    // The server's durable view of the conversation moved on.
    history.insert(
        "conv-1",
        vec![
            history_message("m-1", Role::User, "earlier message"),
            history_message("m-2", Role::Assistant, "canonical reply"),
        ],
    );

    conn.close().await;
    let _second = server.accept().await;

    wait_for_store(&store, "history to be replaced", |state| {
        state.messages.len() == 2
    })
    .await;
    let snapshot = store.snapshot();
    let message_ids: Vec<&str> = snapshot.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(message_ids, ["m-1", "m-2"]);
    assert!(
        snapshot
            .messages
            .iter()
            .all(|m| m.status == MessageStatus::Delivered)
    );
    client.shutdown().await;
}

/// Test that undecodable frames are dropped without wedging the
/// connection.
#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let server = TestServer::spawn().await;
    let (client, _history) = test_client(server.url());

    client.connect().await;
    let conn = server.accept().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    conn.send_raw("not json at all").await;
    conn.send_raw(r#"{"type":"stream:resume","response_id":"r"}"#)
        .await;
    conn.send_raw(r#"{"type":"stream:chunk","response_id":"","chunk":"x","seq":0}"#)
        .await;

    // The read loop is still alive and the protocol still works.
    conn.send_event(&ServerEvent::Ping).await;
    let frame = conn.next_frame().await;
    assert_eq!(frame.event, ClientEvent::Pong);

    let send = send_in_background(&client, "still here?");
    let (ack, _, ids) = conn.next_send().await;
    conn.stream_response(ack, &ids.response_id, &["yes"]).await;
    let receipt = send.await.unwrap().unwrap();

    let store = client.store().clone();
    wait_for_store(&store, "response after bad frames", |state| {
        state
            .message(&receipt.response_id)
            .is_some_and(|m| m.status == MessageStatus::Sent && m.content == "yes")
    })
    .await;
    client.shutdown().await;
}

/// Test message:new handling: foreign messages are added exactly once and
/// the echo of an own send is suppressed.
#[tokio::test]
async fn test_incoming_messages_deduplicated() {
    let server = TestServer::spawn().await;
    let (client, _history) = test_client(server.url());

    client.connect().await;
    let conn = server.accept().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    let foreign = history_message("ext-1", Role::User, "from another session");
    conn.send_event(&ServerEvent::MessageNew {
        message: foreign.clone(),
    })
    .await;
    conn.send_event(&ServerEvent::MessageNew { message: foreign }).await;

    let store = client.store().clone();
    wait_for_store(&store, "foreign message to arrive", |state| {
        state.message("ext-1").is_some()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.message_count(), 1);

    // Own send comes back as message:new; the optimistic copy wins.
    let send = send_in_background(&client, "mine");
    let (ack, _, _) = conn.next_send().await;
    conn.ack(ack).await;
    let receipt = send.await.unwrap().unwrap();

    let echo = history_message(&receipt.request_id, Role::User, "mine");
    conn.send_event(&ServerEvent::MessageNew { message: echo })
        .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.message_count(), 2);
    assert_eq!(
        store.message(&receipt.request_id).unwrap().status,
        MessageStatus::Sent
    );
    client.shutdown().await;
}

/// Test that the retry budget ends in the failed state with the error
/// surfaced to the store.
#[tokio::test]
async fn test_retry_budget_exhausted_enters_failed() {
    let mut config = test_client_config(unused_endpoint());
    config.channel.max_reconnect_attempts = 2;
    let client = ChatClient::new(config, Arc::new(StaticHistory::new()));

    client.connect().await;

    let err = client
        .wait_until_connected(Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::RetriesExhausted { attempts: 2 })
    ));
    assert_eq!(client.state(), ConnectionState::Failed);

    let store = client.store().clone();
    wait_for_store(&store, "failure to surface", |state| state.error.is_some()).await;
    assert_eq!(
        store.snapshot().error.as_deref(),
        Some("connection failed, no longer retrying")
    );

    // Failed is terminal until connect is called again.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(client.state(), ConnectionState::Failed);

    let err = client.send_message("into the void").await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::NotConnected)
    ));
    client.shutdown().await;
}

/// Test that an explicit disconnect interrupts the reconnection cycle and
/// holds the channel at disconnected.
#[tokio::test]
async fn test_disconnect_stops_reconnection() {
    let mut config = test_client_config(unused_endpoint());
    config.channel.max_reconnect_attempts = 50;
    let client = ChatClient::new(config, Arc::new(StaticHistory::new()));

    client.connect().await;
    wait_for_state(client.state_changes(), ConnectionState::Reconnecting).await;

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    client.shutdown().await;
}

/// Test that a cancel request reaches the server and the confirming
/// stream:error terminalizes the response.
#[tokio::test]
async fn test_cancel_terminalizes_response() {
    let server = TestServer::spawn().await;
    let (client, _history) = test_client(server.url());

    client.connect().await;
    let conn = server.accept().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    let send = send_in_background(&client, "long story please");
    let (ack, _, ids) = conn.next_send().await;
    conn.ack(ack).await;
    let receipt = send.await.unwrap().unwrap();

    conn.send_event(&ServerEvent::StreamStart {
        response_id: ids.response_id.clone(),
        conversation_id: None,
        thread_id: None,
    })
    .await;

    client.cancel_response(&receipt.response_id).await.unwrap();

    let frame = conn.next_frame().await;
    assert_eq!(
        frame.event,
        ClientEvent::MessageCancel {
            response_id: receipt.response_id.clone()
        }
    );
    assert!(frame.ack.is_none());

    conn.send_event(&ServerEvent::StreamError {
        response_id: ids.response_id.clone(),
        error: "cancelled by user".to_string(),
    })
    .await;

    let store = client.store().clone();
    wait_for_store(&store, "cancel to terminalize", |state| {
        state
            .message(&receipt.response_id)
            .is_some_and(|m| m.status == MessageStatus::Error)
    })
    .await;
    assert_eq!(
        store
            .message(&receipt.response_id)
            .unwrap()
            .meta_str("error"),
        Some("cancelled by user")
    );
    client.shutdown().await;
}

/// Test that chunks arriving without a stream:start still build a
/// response message.
#[tokio::test]
async fn test_chunks_without_start_open_session() {
    let server = TestServer::spawn().await;
    let (client, _history) = test_client(server.url());

    client.connect().await;
    let conn = server.accept().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    let send = send_in_background(&client, "hello");
    let (ack, _, ids) = conn.next_send().await;
    conn.ack(ack).await;
    let receipt = send.await.unwrap().unwrap();

    conn.send_event(&ServerEvent::StreamChunk {
        response_id: ids.response_id.clone(),
        chunk: "Hello".to_string(),
        seq: 0,
    })
    .await;
    conn.send_event(&ServerEvent::StreamComplete {
        response_id: ids.response_id.clone(),
        content: None,
        metadata: Map::new(),
    })
    .await;

    let store = client.store().clone();
    wait_for_store(&store, "implicit session to settle", |state| {
        state
            .message(&receipt.response_id)
            .is_some_and(|m| m.status == MessageStatus::Sent && m.content == "Hello")
    })
    .await;
    client.shutdown().await;
}

/// Test that a stream:start carrying conversation and thread ids seeds the
/// store and stamps the created response message.
#[tokio::test]
async fn test_stream_start_adopts_server_ids() {
    let server = TestServer::spawn().await;
    let (client, _history) = test_client(server.url());

    client.connect().await;
    let conn = server.accept().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    let send = send_in_background(&client, "first message");
    let (ack, _, ids) = conn.next_send().await;
    conn.ack(ack).await;
    let receipt = send.await.unwrap().unwrap();

    conn.send_event(&ServerEvent::StreamStart {
        response_id: ids.response_id.clone(),
        conversation_id: Some("conv-42".to_string()),
        thread_id: Some("thread-7".to_string()),
    })
    .await;

    let store = client.store().clone();
    wait_for_store(&store, "server ids to reach the response", |state| {
        state
            .message(&receipt.response_id)
            .is_some_and(|m| m.conversation_id.as_deref() == Some("conv-42"))
    })
    .await;

    let snapshot = store.snapshot();
    assert_eq!(snapshot.conversation_id.as_deref(), Some("conv-42"));
    assert_eq!(snapshot.thread_id.as_deref(), Some("thread-7"));

    let response = store.message(&receipt.response_id).unwrap();
    assert_eq!(response.thread_id.as_deref(), Some("thread-7"));
    client.shutdown().await;
}
