//! End-to-end calls: two sessions negotiating through a real relay.
//!
//! Each side runs its own synthetic media and peer backend; only the
//! WebSocket relay connects them, as it would between two browsers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lectern_call::{
    CallCommand, CallConfig, CallDeps, CallEvent, CallId, CallRole, CallSession, CallState,
    ParticipantInfo, PlatformRole, SyntheticMedia, SyntheticPeerBackend, WsSignalingConnector,
};
use lectern_signal::RelayConfig;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

async fn start_relay() -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = lectern_signal::serve(listener, RelayConfig::default(), async {
            let _ = rx.await;
        })
        .await;
    });
    (addr, tx)
}

struct Side {
    events: broadcast::Receiver<CallEvent>,
    commands: mpsc::Sender<CallCommand>,
    task: JoinHandle<(CallState, CallSession)>,
    media: SyntheticMedia,
}

/// Starts a session driven by [`CallSession::run`] on its own task.
fn start_side(relay: SocketAddr, call_id: &str, peer: &str, name: &str, role: CallRole) -> Side {
    let config = CallConfig {
        signaling_url: format!("ws://{relay}"),
        ..CallConfig::default()
    };
    let media = SyntheticMedia::new();
    let deps = CallDeps::new(
        Arc::new(media.clone()),
        Arc::new(SyntheticPeerBackend::new()),
        Arc::new(WsSignalingConnector::new(config.signaling_url.clone())),
        config,
    );
    let (other, other_name) = if peer == "alice" {
        ("bob", "Bob")
    } else {
        ("alice", "Alice")
    };
    let mut session = CallSession::new(
        CallId::from(call_id),
        role,
        ParticipantInfo::local(peer, name, PlatformRole::Mentor),
        ParticipantInfo::remote(other, other_name, PlatformRole::Student),
        deps,
    );

    let events = session.subscribe();
    let (commands, rx) = mpsc::channel(8);
    let task = tokio::spawn(async move {
        let state = session.run(rx).await;
        (state, session)
    });

    Side {
        events,
        commands,
        task,
        media,
    }
}

/// Waits for an event matching `pred`.
async fn wait_for<F>(events: &mut broadcast::Receiver<CallEvent>, mut pred: F) -> CallEvent
where
    F: FnMut(&CallEvent) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    unreachable!("session dropped before the expected event")
                }
            }
        }
    })
    .await
    .expect("Timeout waiting for call event")
}

async fn wait_connected(side: &mut Side) {
    wait_for(&mut side.events, |e| {
        matches!(
            e,
            CallEvent::StateChanged {
                to: CallState::Connected,
                ..
            }
        )
    })
    .await;
}

async fn finish(side: Side) -> (CallState, CallSession) {
    drop(side.commands);
    timeout(Duration::from_secs(10), side.task)
        .await
        .expect("Timeout waiting for session to finish")
        .expect("Session task panicked")
}

// ============================================================================
// Happy Path
// ============================================================================

#[tokio::test]
async fn test_two_sessions_connect_chat_and_hang_up() {
    let (relay, _stop) = start_relay().await;

    let mut alice = start_side(relay, "lesson-1", "alice", "Alice", CallRole::Caller);
    let mut bob = start_side(relay, "lesson-1", "bob", "Bob", CallRole::Callee);

    wait_connected(&mut alice).await;
    wait_connected(&mut bob).await;

    alice
        .commands
        .send(CallCommand::SendChat("welcome to the lesson".to_string()))
        .await
        .unwrap();
    let event = wait_for(&mut bob.events, |e| matches!(e, CallEvent::Chat { .. })).await;
    let CallEvent::Chat { message } = event else {
        unreachable!()
    };
    assert_eq!(message.sender, "Alice");
    assert_eq!(message.text, "welcome to the lesson");

    alice
        .commands
        .send(CallCommand::End("lesson over".to_string()))
        .await
        .unwrap();

    let alice_media = alice.media.clone();
    let bob_media = bob.media.clone();
    let (alice_state, alice_session) = finish(alice).await;
    let (bob_state, bob_session) = finish(bob).await;

    let expected = [
        CallState::Idle,
        CallState::AcquiringMedia,
        CallState::AwaitingSignaling,
        CallState::Negotiating,
        CallState::Connected,
        CallState::Ending,
        CallState::Ended,
    ];
    assert_eq!(alice_state, CallState::Ended);
    assert_eq!(bob_state, CallState::Ended);
    assert_eq!(alice_session.history(), expected);
    assert_eq!(bob_session.history(), expected);

    assert_eq!(alice_session.chat().len(), 1);
    assert_eq!(bob_session.chat().len(), 1);
    assert_eq!(alice_media.active_tracks(), 0);
    assert_eq!(bob_media.active_tracks(), 0);
}

#[tokio::test]
async fn test_callee_may_join_first() {
    let (relay, _stop) = start_relay().await;

    let mut bob = start_side(relay, "lesson-2", "bob", "Bob", CallRole::Callee);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut alice = start_side(relay, "lesson-2", "alice", "Alice", CallRole::Caller);

    wait_connected(&mut alice).await;
    wait_connected(&mut bob).await;

    bob.commands
        .send(CallCommand::End("done".to_string()))
        .await
        .unwrap();

    let (bob_state, _) = finish(bob).await;
    let (alice_state, alice_session) = finish(alice).await;
    assert_eq!(bob_state, CallState::Ended);
    assert_eq!(alice_state, CallState::Ended);
    assert!(alice_session.remote_tracks().is_empty());
}

#[tokio::test]
async fn test_remote_tracks_are_reported() {
    let (relay, _stop) = start_relay().await;

    let mut alice = start_side(relay, "lesson-3", "alice", "Alice", CallRole::Caller);
    let mut bob = start_side(relay, "lesson-3", "bob", "Bob", CallRole::Callee);

    let mut kinds = Vec::new();
    for _ in 0..2 {
        let event = wait_for(&mut alice.events, |e| {
            matches!(e, CallEvent::RemoteTrack { .. })
        })
        .await;
        if let CallEvent::RemoteTrack { track } = event {
            kinds.push(track.kind.to_string());
        }
    }
    kinds.sort();
    assert_eq!(kinds, ["audio", "video"]);

    wait_connected(&mut bob).await;
    let (state, _) = finish(alice).await;
    assert_eq!(state, CallState::Ended);
    let (state, _) = finish(bob).await;
    assert_eq!(state, CallState::Ended);
}

// ============================================================================
// Failure Paths
// ============================================================================

#[tokio::test]
async fn test_unreachable_relay_fails_the_call() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = unused.local_addr().unwrap();
    drop(unused);

    let side = start_side(addr, "lesson-4", "alice", "Alice", CallRole::Caller);
    let media = side.media.clone();
    let (state, session) = timeout(Duration::from_secs(15), side.task)
        .await
        .expect("Timeout waiting for failure")
        .expect("Session task panicked");

    assert_eq!(state, CallState::Error);
    assert_eq!(
        session.history(),
        [
            CallState::Idle,
            CallState::AcquiringMedia,
            CallState::AwaitingSignaling,
            CallState::Error
        ]
    );
    assert!(session.error().is_some());
    assert_eq!(media.active_tracks(), 0);
}
