//! Integration tests for the signaling relay over real sockets.
//!
//! These tests bind the relay to an ephemeral port and talk to it with
//! plain WebSocket and HTTP clients.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lectern_call::{CallId, ChatMessage, SignalBody, SignalingMessage};
use lectern_signal::RelayConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tungstenite::Message;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestRelay {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestRelay {
    async fn start(config: RelayConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get local addr");
        let (tx, rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            lectern_signal::serve(listener, config, async {
                let _ = rx.await;
            })
            .await
            .expect("Relay failed");
        });

        Self {
            addr,
            shutdown: Some(tx),
            handle,
        }
    }

    fn ws_url(&self, call_id: &str, peer: &str) -> String {
        format!("ws://{}/ws/{call_id}?peer={peer}", self.addr)
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn connect(&self, call_id: &str, peer: &str) -> WsClient {
        let (ws, _) = connect_async(self.ws_url(call_id, peer))
            .await
            .expect("Failed to connect to relay");
        ws
    }

    async fn room_peers(&self, call_id: &str) -> Option<Vec<String>> {
        let response = reqwest::get(self.http_url(&format!("/rooms/{call_id}")))
            .await
            .expect("Room request failed");
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return None;
        }
        let body: serde_json::Value = response.json().await.expect("Invalid room body");
        Some(
            body["peers"]
                .as_array()
                .expect("peers array")
                .iter()
                .filter_map(|p| p.as_str().map(ToString::to_string))
                .collect(),
        )
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = timeout(Duration::from_secs(1), self.handle).await;
    }
}

/// Receives the next text frame, answering pings along the way.
async fn next_text(client: &mut WsClient) -> String {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("Timeout waiting for frame")
            .expect("Stream ended")
            .expect("WebSocket error");

        match msg {
            Message::Text(text) => return text,
            Message::Ping(data) => {
                client
                    .send(Message::Pong(data))
                    .await
                    .expect("Failed to send pong");
            }
            Message::Pong(_) => {}
            other => unreachable!("Expected text frame, got: {other:?}"),
        }
    }
}

fn frame(call_id: &str, from: &str, body: SignalBody) -> Message {
    Message::Text(
        SignalingMessage::new(CallId::from(call_id), from, body)
            .encode()
            .expect("encode"),
    )
}

/// Polls until the room reaches `expected`.
async fn wait_for_room(relay: &TestRelay, call_id: &str, expected: Option<Vec<String>>) {
    for _ in 0..50 {
        if relay.room_peers(call_id).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(relay.room_peers(call_id).await, expected);
}

// ============================================================================
// Forwarding Tests
// ============================================================================

#[tokio::test]
async fn test_frames_are_forwarded_with_authenticated_sender() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let mut alice = relay.connect("c1", "alice").await;
    let mut bob = relay.connect("c1", "bob").await;

    alice
        .send(frame("c1", "someone-else", SignalBody::Ready))
        .await
        .unwrap();

    let received = SignalingMessage::decode(&next_text(&mut bob).await).unwrap();
    assert_eq!(received.from, "alice");
    assert_eq!(received.body, SignalBody::Ready);

    relay.stop().await;
}

#[tokio::test]
async fn test_chat_travels_both_ways() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let mut alice = relay.connect("c1", "alice").await;
    let mut bob = relay.connect("c1", "bob").await;

    let hello = ChatMessage::new("Alice", "hello");
    alice
        .send(frame("c1", "alice", SignalBody::Chat(hello.clone())))
        .await
        .unwrap();
    let got = SignalingMessage::decode(&next_text(&mut bob).await).unwrap();
    assert_eq!(got.body, SignalBody::Chat(hello));

    let reply = ChatMessage::new("Bob", "hi");
    bob.send(frame("c1", "bob", SignalBody::Chat(reply.clone())))
        .await
        .unwrap();
    let got = SignalingMessage::decode(&next_text(&mut alice).await).unwrap();
    assert_eq!(got.from, "bob");
    assert_eq!(got.body, SignalBody::Chat(reply));

    relay.stop().await;
}

#[tokio::test]
async fn test_rooms_do_not_leak_frames() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let mut alice = relay.connect("c1", "alice").await;
    let mut bob = relay.connect("c1", "bob").await;
    let mut other = relay.connect("c2", "carol").await;

    alice
        .send(frame("c1", "alice", SignalBody::Ready))
        .await
        .unwrap();
    next_text(&mut bob).await;

    let leaked = timeout(Duration::from_millis(200), other.next()).await;
    assert!(leaked.is_err(), "frame leaked into another room");

    relay.stop().await;
}

// ============================================================================
// Rejection Tests
// ============================================================================

#[tokio::test]
async fn test_invalid_frames_get_error_reply_and_are_dropped() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let mut alice = relay.connect("c1", "alice").await;
    let mut bob = relay.connect("c1", "bob").await;

    alice
        .send(Message::Text("not json".to_string()))
        .await
        .unwrap();
    let reply: serde_json::Value = serde_json::from_str(&next_text(&mut alice).await).unwrap();
    assert!(reply["error"]
        .as_str()
        .unwrap()
        .starts_with("Invalid signaling frame"));

    alice
        .send(frame("c2", "alice", SignalBody::Ready))
        .await
        .unwrap();
    let reply: serde_json::Value = serde_json::from_str(&next_text(&mut alice).await).unwrap();
    assert!(reply["error"].as_str().unwrap().contains("'c2'"));

    let leaked = timeout(Duration::from_millis(200), bob.next()).await;
    assert!(leaked.is_err(), "invalid frame reached the other peer");

    relay.stop().await;
}

#[tokio::test]
async fn test_oversized_frame_is_rejected() {
    let config = RelayConfig {
        max_message_bytes: 256,
        ..RelayConfig::default()
    };
    let relay = TestRelay::start(config).await;
    let mut alice = relay.connect("c1", "alice").await;

    let long = ChatMessage::new("Alice", "x".repeat(512));
    alice
        .send(frame("c1", "alice", SignalBody::Chat(long)))
        .await
        .unwrap();
    let reply: serde_json::Value = serde_json::from_str(&next_text(&mut alice).await).unwrap();
    assert!(reply["error"].as_str().unwrap().contains("256-byte limit"));

    relay.stop().await;
}

#[tokio::test]
async fn test_third_peer_is_refused() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let _alice = relay.connect("c1", "alice").await;
    let _bob = relay.connect("c1", "bob").await;

    let err = connect_async(relay.ws_url("c1", "carol"))
        .await
        .expect_err("third peer must be refused");
    match err {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), tungstenite::http::StatusCode::CONFLICT);
        }
        other => unreachable!("expected HTTP refusal, got {other:?}"),
    }

    relay.stop().await;
}

#[tokio::test]
async fn test_missing_peer_is_refused() {
    let relay = TestRelay::start(RelayConfig::default()).await;

    let err = connect_async(format!("ws://{}/ws/c1", relay.addr))
        .await
        .expect_err("missing peer must be refused");
    assert!(matches!(
        err,
        tungstenite::Error::Http(ref response)
            if response.status() == tungstenite::http::StatusCode::BAD_REQUEST
    ));

    relay.stop().await;
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_disconnect_frees_seat_and_removes_empty_room() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let mut alice = relay.connect("c1", "alice").await;
    let bob = relay.connect("c1", "bob").await;
    wait_for_room(&relay, "c1", Some(vec!["alice".into(), "bob".into()])).await;

    drop(bob);
    wait_for_room(&relay, "c1", Some(vec!["alice".into()])).await;

    let bob_again = relay.connect("c1", "bob").await;
    wait_for_room(&relay, "c1", Some(vec!["alice".into(), "bob".into()])).await;

    alice.close(None).await.unwrap();
    drop(bob_again);
    wait_for_room(&relay, "c1", None).await;

    let health: serde_json::Value = reqwest::get(relay.http_url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["rooms"], 0);

    relay.stop().await;
}

#[tokio::test]
async fn test_rejoin_replaces_seat_still_held_by_old_socket() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let mut stale = relay.connect("c1", "alice").await;
    let mut bob = relay.connect("c1", "bob").await;
    wait_for_room(&relay, "c1", Some(vec!["alice".into(), "bob".into()])).await;

    // The old socket is still open; the same peer id joins again.
    let mut fresh = relay.connect("c1", "alice").await;
    wait_for_room(&relay, "c1", Some(vec!["bob".into(), "alice".into()])).await;

    let ended = timeout(Duration::from_secs(5), async {
        loop {
            match stale.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "replaced socket was not closed");

    bob.send(frame("c1", "bob", SignalBody::Ready)).await.unwrap();
    let received = SignalingMessage::decode(&next_text(&mut fresh).await).unwrap();
    assert_eq!(received.from, "bob");

    fresh
        .send(frame("c1", "alice", SignalBody::Ready))
        .await
        .unwrap();
    let received = SignalingMessage::decode(&next_text(&mut bob).await).unwrap();
    assert_eq!(received.from, "alice");

    // The replaced connection leaving does not take the new seat with it.
    drop(stale);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        relay.room_peers("c1").await,
        Some(vec!["bob".to_string(), "alice".to_string()])
    );

    relay.stop().await;
}

#[tokio::test]
async fn test_silent_peer_is_dropped_after_missed_pongs() {
    let config = RelayConfig {
        heartbeat_secs: 1,
        max_missed_pongs: 1,
        ..RelayConfig::default()
    };
    let relay = TestRelay::start(config).await;

    // Never polled, so pings go unanswered.
    let _silent = relay.connect("c1", "alice").await;
    wait_for_room(&relay, "c1", Some(vec!["alice".into()])).await;

    tokio::time::sleep(Duration::from_millis(2500)).await;
    wait_for_room(&relay, "c1", None).await;

    relay.stop().await;
}

#[tokio::test]
async fn test_responsive_peer_survives_heartbeats() {
    let config = RelayConfig {
        heartbeat_secs: 1,
        max_missed_pongs: 1,
        ..RelayConfig::default()
    };
    let relay = TestRelay::start(config).await;
    let mut alice = relay.connect("c1", "alice").await;

    let deadline = tokio::time::Instant::now() + Duration::from_millis(3500);
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(Ok(Message::Ping(data)))) =
            timeout(Duration::from_millis(200), alice.next()).await
        {
            alice.send(Message::Pong(data)).await.unwrap();
        }
    }

    assert_eq!(relay.room_peers("c1").await, Some(vec!["alice".to_string()]));
    relay.stop().await;
}
