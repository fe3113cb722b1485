//! Integration tests for end-to-end WebSocket fan-out.
//!
//! These tests start a real server on a loopback port and connect real
//! sockets, verifying the full create → store → broadcast pipeline.

use chapp_server::client::{ChatClient, ChatEvent, ConnectionState};
use chapp_server::protocol::{
    ClientRequest, DeleteNotice, DeleteRequest, EditNotice, EditRequest, Message, ServerEvent,
};
use chapp_server::server::ChatServer;
use chapp_server::store::StoreError;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Start an in-memory server on a free port.
async fn start_test_server() -> (Arc<ChatServer>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let server = Arc::new(ChatServer::with_defaults());

    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (server, url)
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

/// Wait until the registry holds exactly `n` connections.
async fn wait_for_connections(server: &ChatServer, n: usize) {
    timeout(Duration::from_secs(2), async {
        while server.stats().active_connections != n {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "expected {n} connections, have {}",
            server.stats().active_connections
        )
    });
}

async fn send_text(ws: &mut WsStream, text: impl Into<String>) {
    let text: String = text.into();
    ws.send(WsMessage::Text(text.into())).await.unwrap();
}

async fn send_create(ws: &mut WsStream, author: &str, content: &str, time: i64) {
    let mut msg = Message::new(author, content, time);
    msg.id = "client-chosen".into();
    send_text(ws, ClientRequest::Create(msg).encode().unwrap()).await;
}

/// Next broadcast event, skipping control frames.
async fn next_event(ws: &mut WsStream) -> ServerEvent {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let WsMessage::Text(text) = frame {
            return ServerEvent::decode(text.as_str()).unwrap();
        }
    }
}

async fn assert_silent(ws: &mut WsStream) {
    loop {
        match timeout(Duration::from_millis(100), ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(WsMessage::Text(text)))) => panic!("unexpected frame: {text}"),
            Ok(Some(Ok(_))) => continue,
            Ok(other) => panic!("connection ended: {other:?}"),
        }
    }
}

fn expect_created(event: ServerEvent) -> Message {
    match event {
        ServerEvent::Create(msg) => msg,
        other => panic!("Expected create broadcast, got {other:?}"),
    }
}

// ─── Fan-out ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_fans_out_to_every_connection() {
    let (server, url) = start_test_server().await;
    let mut a = connect(&url).await;
    let mut b = connect(&url).await;
    wait_for_connections(&server, 2).await;

    send_create(&mut a, "alice", "hi", 1).await;

    let seen_by_a = expect_created(next_event(&mut a).await);
    let seen_by_b = expect_created(next_event(&mut b).await);

    assert_eq!(seen_by_a, seen_by_b);
    assert!(!seen_by_a.id.is_empty());
    assert_ne!(seen_by_a.id, "client-chosen");
    assert_eq!(seen_by_a.author, "alice");
    assert_eq!(seen_by_a.content, "hi");
    assert_eq!(seen_by_a.time, 1);

    let listed = server.service().list().unwrap();
    assert_eq!(listed.get(&seen_by_a.id), Some(&seen_by_a));
}

#[tokio::test]
async fn test_service_delete_broadcasts_and_enforces_author() {
    let (server, url) = start_test_server().await;
    let mut a = connect(&url).await;
    let mut b = connect(&url).await;
    wait_for_connections(&server, 2).await;

    send_create(&mut a, "alice", "hi", 1).await;
    let id = expect_created(next_event(&mut a).await).id;
    expect_created(next_event(&mut b).await);

    let forbidden = server.service().delete(DeleteRequest {
        msg_id: id.clone(),
        author: "bob".into(),
    });
    assert!(matches!(forbidden, Err(StoreError::Forbidden { .. })));
    assert_silent(&mut a).await;

    server
        .service()
        .delete(DeleteRequest {
            msg_id: id.clone(),
            author: "alice".into(),
        })
        .unwrap();

    let expected = ServerEvent::Delete(DeleteNotice { msg_id: id.clone() });
    assert_eq!(next_event(&mut a).await, expected);
    assert_eq!(next_event(&mut b).await, expected);

    let again = server.service().delete(DeleteRequest {
        msg_id: id.clone(),
        author: "bob".into(),
    });
    assert_eq!(again, Err(StoreError::NotFound(id.clone())));
    assert!(!server.service().list().unwrap().contains_key(&id));
}

#[tokio::test]
async fn test_service_edit_broadcasts_notice() {
    let (server, url) = start_test_server().await;
    let mut a = connect(&url).await;
    wait_for_connections(&server, 1).await;

    let stored = server
        .service()
        .create(Message::new("alice", "draft", 5))
        .unwrap();
    assert_eq!(expect_created(next_event(&mut a).await), stored);

    server
        .service()
        .edit(EditRequest {
            msg_id: stored.id.clone(),
            author: "alice".into(),
            content: "final".into(),
        })
        .unwrap();

    assert_eq!(
        next_event(&mut a).await,
        ServerEvent::Edit(EditNotice {
            msg_id: stored.id.clone(),
            content: "final".into(),
        })
    );
    let listed = server.service().list().unwrap();
    assert_eq!(listed[&stored.id].content, "final");
    assert_eq!(listed[&stored.id].time, 5);
}

// ─── Session robustness ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_bad_frames_do_not_close_the_session() {
    let (server, url) = start_test_server().await;
    let mut a = connect(&url).await;
    wait_for_connections(&server, 1).await;

    send_text(&mut a, "not json").await;
    send_text(&mut a, r#"{"msgType":"typing","payload":{}}"#).await;
    send_text(&mut a, r#"{"msgType":"create","payload":{"author":7}}"#).await;
    a.send(WsMessage::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    send_create(&mut a, "alice", "still here", 2).await;

    let msg = expect_created(next_event(&mut a).await);
    assert_eq!(msg.content, "still here");
    assert_eq!(server.service().list().unwrap().len(), 1);

    let stats = server.stats();
    assert_eq!(stats.frames_received, 5);
    assert_eq!(stats.frames_rejected, 4);
}

#[tokio::test]
async fn test_legacy_request_tag_is_accepted() {
    let (server, url) = start_test_server().await;
    let mut a = connect(&url).await;
    wait_for_connections(&server, 1).await;

    send_text(
        &mut a,
        r#"{"reqType":"create","payload":{"id":"","author":"old","content":"browser","time":3}}"#,
    )
    .await;

    let msg = expect_created(next_event(&mut a).await);
    assert_eq!(msg.author, "old");
}

#[tokio::test]
async fn test_socket_edit_and_delete_are_ignored() {
    let (server, url) = start_test_server().await;
    let mut a = connect(&url).await;
    wait_for_connections(&server, 1).await;

    send_create(&mut a, "alice", "keep me", 1).await;
    let id = expect_created(next_event(&mut a).await).id;

    let delete = ClientRequest::Delete(DeleteRequest {
        msg_id: id.clone(),
        author: "alice".into(),
    });
    send_text(&mut a, delete.encode().unwrap()).await;
    assert_silent(&mut a).await;

    assert!(server.service().list().unwrap().contains_key(&id));
}

#[tokio::test]
async fn test_ping_gets_pong() {
    let (server, url) = start_test_server().await;
    let mut a = connect(&url).await;
    wait_for_connections(&server, 1).await;

    a.send(WsMessage::Ping(vec![9u8, 9].into())).await.unwrap();

    let frame = timeout(Duration::from_secs(2), a.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match frame {
        WsMessage::Pong(data) => assert_eq!(&data[..], &[9, 9]),
        other => panic!("Expected pong, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_deregisters() {
    let (server, url) = start_test_server().await;
    let mut a = connect(&url).await;
    let mut b = connect(&url).await;
    wait_for_connections(&server, 2).await;

    b.close(None).await.unwrap();
    drop(b);
    wait_for_connections(&server, 1).await;

    let stored = server
        .service()
        .create(Message::new("alice", "after", 1))
        .unwrap();
    assert_eq!(expect_created(next_event(&mut a).await), stored);
    assert_eq!(server.stats().broadcast.connections_pruned, 0);
    assert_eq!(server.stats().total_connections, 2);
}

#[tokio::test]
async fn test_concurrent_creates_from_two_sessions() {
    let (server, url) = start_test_server().await;
    let mut a = connect(&url).await;
    let mut b = connect(&url).await;
    wait_for_connections(&server, 2).await;

    for i in 0..20 {
        send_create(&mut a, "alice", &format!("a{i}"), i).await;
        send_create(&mut b, "bob", &format!("b{i}"), i).await;
    }

    for ws in [&mut a, &mut b] {
        let mut ids = HashSet::new();
        let mut from_alice = Vec::new();
        for _ in 0..40 {
            let msg = expect_created(next_event(ws).await);
            if msg.author == "alice" {
                from_alice.push(msg.content.clone());
            }
            ids.insert(msg.id);
        }
        assert_eq!(ids.len(), 40);
        let expected: Vec<String> = (0..20).map(|i| format!("a{i}")).collect();
        assert_eq!(from_alice, expected, "per-session order must be preserved");
    }

    assert_eq!(server.service().list().unwrap().len(), 40);
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let server = Arc::new(ChatServer::with_defaults());
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let running = server.clone();
    let handle = tokio::spawn(async move {
        running
            .serve_until(listener, async {
                let _ = stop_rx.await;
            })
            .await
    });

    let mut a = connect(&url).await;
    wait_for_connections(&server, 1).await;

    stop_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();

    let ended = timeout(Duration::from_secs(2), async {
        loop {
            match a.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "client should observe the close");
    assert_eq!(server.stats().active_connections, 0);
}

#[tokio::test]
async fn test_shutdown_abandons_pending_handshake() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(ChatServer::with_defaults());
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let running = server.clone();
    let handle = tokio::spawn(async move {
        running
            .serve_until(listener, async {
                let _ = stop_rx.await;
            })
            .await
    });

    // TCP connected, WebSocket upgrade not yet sent.
    let tcp = TcpStream::connect(addr).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    stop_tx.send(()).unwrap();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("serve_until should return promptly")
        .unwrap()
        .unwrap();

    let late = tokio_tungstenite::client_async(format!("ws://{addr}/ws"), tcp).await;
    if let Ok((mut ws, _)) = late {
        let _ = ws
            .send(WsMessage::Text(
                ClientRequest::Create(Message::new("late", "after shutdown", 1))
                    .encode()
                    .unwrap()
                    .into(),
            ))
            .await;
        sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(server.stats().active_connections, 0);
    assert_eq!(server.stats().total_connections, 0);
    assert!(server.service().list().unwrap().is_empty());
}

// ─── ChatClient ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_client_round_trip() {
    let (server, url) = start_test_server().await;
    let mut client = ChatClient::new(&url);
    let mut events = client.take_event_rx().unwrap();

    client.connect().await.unwrap();
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_eq!(
        timeout(Duration::from_secs(2), events.recv()).await.unwrap(),
        Some(ChatEvent::Connected)
    );
    wait_for_connections(&server, 1).await;

    client
        .send_message(Message::new("carol", "from client", 9))
        .await
        .unwrap();

    match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(ChatEvent::Created(msg)) => {
            assert_eq!(msg.author, "carol");
            assert!(!msg.id.is_empty());
        }
        other => panic!("Expected Created event, got {other:?}"),
    }

    client.disconnect().await.unwrap();
    wait_for_connections(&server, 0).await;
}

#[tokio::test]
async fn test_chat_client_flushes_outbox_on_connect() {
    let (server, url) = start_test_server().await;
    let mut client = ChatClient::new(&url);
    let mut events = client.take_event_rx().unwrap();

    client
        .send_message(Message::new("dave", "written offline", 1))
        .await
        .unwrap();
    assert_eq!(client.outbox_len().await, 1);

    client.connect().await.unwrap();
    assert_eq!(client.outbox_len().await, 0);

    let mut created = None;
    while created.is_none() {
        match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
            Some(ChatEvent::Created(msg)) => created = Some(msg),
            Some(_) => continue,
            None => panic!("event channel closed"),
        }
    }
    assert_eq!(created.unwrap().content, "written offline");
    assert_eq!(server.service().list().unwrap().len(), 1);
}
