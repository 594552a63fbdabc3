// Full stack over a real socket: axum router, connection tasks, dispatcher.

mod common;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use roomsignal::config::ServerConfig;
use roomsignal::media::LocalEngine;
use roomsignal::room::settings::RoomSettings;
use roomsignal::room::{ConnectionState, RoomRegistry};
use roomsignal::signaling::SignalingServer;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Writer = SplitSink<Socket, Message>;
type Reader = SplitStream<Socket>;

async fn start_server() -> (SocketAddr, RoomRegistry) {
    let mut config = ServerConfig::from_vars(&HashMap::new()).unwrap();
    config.rooms = RoomSettings::default().with_reconnect_grace(Duration::from_secs(30));
    let registry = common::registry(Arc::new(LocalEngine::new()), config.rooms.clone());
    let app = SignalingServer::new(registry.clone(), &config).router();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, registry)
}

async fn connect(addr: SocketAddr, room: &str, peer: &str) -> (Writer, Reader) {
    let url = format!("ws://{addr}/ws?roomId={room}&peerId={peer}");
    let (ws, _) = connect_async(url).await.expect("websocket handshake");
    ws.split()
}

/// Next text frame as JSON; None once the server closed the socket
async fn next_frame(read: &mut Reader) -> Option<Value> {
    let wait = async {
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).expect("frame is JSON")),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("server stayed silent")
}

async fn expect_method(read: &mut Reader, method: &str) -> Value {
    loop {
        let frame = next_frame(read).await.unwrap_or_else(|| panic!("closed before {method}"));
        if frame["method"] == method {
            return frame;
        }
    }
}

async fn request(write: &mut Writer, read: &mut Reader, id: u64, method: &str, data: Value) -> Value {
    let frame = json!({ "request": true, "id": id, "method": method, "data": data });
    write.send(Message::Text(frame.to_string().into())).await.unwrap();
    loop {
        let frame = next_frame(read).await.expect("connection closed before response");
        if frame["response"] == true && frame["id"] == id {
            return frame;
        }
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let req = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).await.unwrap();
    let mut body = String::new();
    stream.read_to_string(&mut body).await.unwrap();
    body
}

async fn wait_for_state(registry: &RoomRegistry, room: &str, peer: &str, state: Option<ConnectionState>) {
    for _ in 0..200 {
        if let Ok(lock) = registry.get_room(room) {
            if lock.read().await.connection_state(peer) == state {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("peer {peer} never reached {state:?}");
}

#[tokio::test]
async fn join_request_leave_and_resume_over_websocket() {
    let (addr, registry) = start_server().await;

    let (mut alice_w, mut alice_r) = connect(addr, "lobby", "alice").await;
    let joined = expect_method(&mut alice_r, "roomJoined").await;
    assert_eq!(joined["notification"], true);
    assert_eq!(joined["data"]["roomId"], "lobby");
    assert_eq!(joined["data"]["peers"], json!([]));

    let caps = request(&mut alice_w, &mut alice_r, 1, "getRouterRtpCapabilities", Value::Null).await;
    assert_eq!(caps["ok"], true);
    assert!(caps["data"]["rtpCapabilities"]["codecs"].is_array());

    let (mut bob_w, mut bob_r) = connect(addr, "lobby", "bob").await;
    let joined = expect_method(&mut bob_r, "roomJoined").await;
    assert_eq!(joined["data"]["peers"][0]["peerId"], "alice");
    let arrived = expect_method(&mut alice_r, "peerJoined").await;
    assert_eq!(arrived["data"]["peerId"], "bob");

    let health = http_get(addr, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.contains(r#""peers":2"#));

    // Unknown methods still get a correlated answer
    let unknown = request(&mut bob_w, &mut bob_r, 7, "teleport", json!({})).await;
    assert_eq!(unknown["ok"], false);
    assert_eq!(unknown["error"]["code"], "ValidationError");
    assert_eq!(unknown["error"]["retriable"], false);

    // Binary frames are refused without closing the connection
    bob_w.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    let refused = next_frame(&mut bob_r).await.unwrap();
    assert_eq!(refused["id"], 0);
    assert_eq!(refused["ok"], false);

    let left = request(&mut bob_w, &mut bob_r, 8, "leave", Value::Null).await;
    assert_eq!(left["data"], json!({ "left": true }));
    assert!(next_frame(&mut bob_r).await.is_none());
    let gone = expect_method(&mut alice_r, "peerLeft").await;
    assert_eq!(gone["data"]["peerId"], "bob");
    wait_for_state(&registry, "lobby", "bob", None).await;

    // Dropping the socket starts the grace period instead of removing alice
    drop(alice_w);
    drop(alice_r);
    wait_for_state(&registry, "lobby", "alice", Some(ConnectionState::Disconnected)).await;
    assert!(registry.has_room("lobby"));

    let (mut alice_w, mut alice_r) = connect(addr, "lobby", "alice").await;
    let rejoined = expect_method(&mut alice_r, "roomJoined").await;
    assert!(rejoined["data"]["resumed"].is_object());
    let caps = request(&mut alice_w, &mut alice_r, 2, "getRouterRtpCapabilities", Value::Null).await;
    assert_eq!(caps["ok"], true);
}

#[tokio::test]
async fn second_connection_for_a_connected_peer_is_refused() {
    let (addr, _registry) = start_server().await;
    let (_alice_w, mut alice_r) = connect(addr, "lobby", "alice").await;
    expect_method(&mut alice_r, "roomJoined").await;

    let (_dup_w, mut dup_r) = connect(addr, "lobby", "alice").await;
    let refused = next_frame(&mut dup_r).await.unwrap();
    assert_eq!(refused["response"], true);
    assert_eq!(refused["ok"], false);
    assert_eq!(refused["error"]["code"], "InvalidState");
    assert!(next_frame(&mut dup_r).await.is_none());
}

#[tokio::test]
async fn upgrade_requires_room_and_peer_ids() {
    let (addr, _registry) = start_server().await;
    assert!(connect_async(format!("ws://{addr}/ws?roomId=lobby")).await.is_err());
    assert!(connect_async(format!("ws://{addr}/ws?peerId=alice")).await.is_err());
    let too_long = "p".repeat(129);
    assert!(connect_async(format!("ws://{addr}/ws?roomId=lobby&peerId={too_long}")).await.is_err());

    let health = http_get(addr, "/health").await;
    assert!(health.contains(r#""rooms":0"#), "{health}");
}
