//! HTTP and WebSocket surface of the relay.
//!
//! # Endpoints
//!
//! - `GET /ws/:call_id?peer=<id>` - join the call's room over a WebSocket
//! - `GET /health` - liveness and room count
//! - `GET /rooms/:call_id` - peers currently in a room
//!
//! Every text frame a peer sends must be a signaling message for the room's
//! call. Valid frames are forwarded to the other peers with `from` set to the
//! sender's peer id; invalid ones are answered with `{"error": ...}` and
//! dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use lectern_call::{CallId, SignalingMessage};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{ErrorResponse, Result, SignalError};
use crate::rooms::{Membership, RoomRegistry};

// ============================================================================
// State
// ============================================================================

/// Shared state for relay handlers.
#[derive(Debug, Clone)]
pub struct RelayState {
    /// Relay settings.
    pub config: RelayConfig,
    /// Connected peers by call.
    pub rooms: RoomRegistry,
}

impl RelayState {
    /// Creates state with empty rooms.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        let rooms = RoomRegistry::new(config.max_peers_per_room);
        Self { config, rooms }
    }
}

/// Query string of the WebSocket endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinQuery {
    /// Peer id of the connecting participant.
    pub peer: Option<String>,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: String,
    /// Non-empty rooms.
    pub rooms: usize,
}

/// Body of `GET /rooms/:call_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomResponse {
    /// The call.
    pub call_id: CallId,
    /// Connected peer ids in join order.
    pub peers: Vec<String>,
}

// ============================================================================
// Router Setup
// ============================================================================

/// Creates the relay router with tracing and permissive CORS.
pub fn create_router(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws/:call_id", get(ws_handler))
        .route("/health", get(handle_health))
        .route("/rooms/:call_id", get(handle_room))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::new(state))
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, config: RelayConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(addr = %addr, "signaling relay listening");
    axum::serve(listener, create_router(RelayState::new(config)))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("signaling relay stopped");
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn handle_health(State(state): State<Arc<RelayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        rooms: state.rooms.room_count(),
    })
}

async fn handle_room(
    Path(call_id): Path<String>,
    State(state): State<Arc<RelayState>>,
) -> Result<Json<RoomResponse>> {
    let call_id = CallId::from(call_id);
    let peers = state
        .rooms
        .peers(&call_id)
        .ok_or_else(|| SignalError::RoomNotFound(call_id.to_string()))?;
    Ok(Json(RoomResponse { call_id, peers }))
}

/// Admits the peer before upgrading so refusals are plain HTTP errors.
///
/// Joining with a peer id that is still seated replaces the old connection.
async fn ws_handler(
    Path(call_id): Path<String>,
    Query(query): Query<JoinQuery>,
    State(state): State<Arc<RelayState>>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response> {
    let peer = query
        .peer
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .ok_or(SignalError::MissingPeer)?;
    let call_id = CallId::from(call_id);

    let Some(ws) = ws else {
        state.rooms.admits(&call_id, &peer)?;
        return Err(SignalError::UpgradeRequired);
    };
    let (membership, outbox) =
        state
            .rooms
            .join(&call_id, &peer, state.config.outbox_capacity)?;

    let limits = Limits::from(&state.config);
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, membership, outbox, limits))
        .into_response())
}

// ============================================================================
// Socket Loop
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_message_bytes: usize,
    heartbeat: Duration,
    max_missed_pongs: u32,
}

impl From<&RelayConfig> for Limits {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_message_bytes: config.max_message_bytes,
            heartbeat: config.heartbeat(),
            max_missed_pongs: config.max_missed_pongs,
        }
    }
}

/// Checks a peer's text frame and returns the frame to forward.
///
/// The returned frame carries `from = peer_id` whatever the sender claimed.
pub fn validate_frame(
    text: &str,
    call_id: &CallId,
    peer_id: &str,
    max_bytes: usize,
) -> Result<String> {
    if text.len() > max_bytes {
        return Err(SignalError::FrameTooLarge {
            size: text.len(),
            max: max_bytes,
        });
    }
    let mut message =
        SignalingMessage::decode(text).map_err(|e| SignalError::InvalidFrame(e.to_string()))?;
    if &message.call_id != call_id {
        return Err(SignalError::WrongCall {
            expected: call_id.to_string(),
            got: message.call_id.to_string(),
        });
    }
    message.from = peer_id.to_string();
    message
        .encode()
        .map_err(|e| SignalError::InvalidFrame(e.to_string()))
}

fn error_frame(err: &SignalError) -> String {
    serde_json::to_string(&ErrorResponse::from(err))
        .unwrap_or_else(|_| r#"{"error":"invalid frame"}"#.to_string())
}

/// Pumps one peer's socket:
///
/// - validates and forwards inbound text frames
/// - writes frames other peers forwarded here
/// - pings every heartbeat and closes after too many unanswered pings
///
/// Leaves the room when the socket ends.
async fn handle_socket(
    socket: WebSocket,
    membership: Membership,
    mut outbox: mpsc::Receiver<String>,
    limits: Limits,
) {
    let (mut sender, mut receiver) = socket.split();
    let call_id = membership.call_id().clone();
    let peer = membership.peer_id().to_string();

    let mut heartbeat = interval_at(Instant::now() + limits.heartbeat, limits.heartbeat);
    let mut missed_pongs = 0u32;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match validate_frame(&text, &call_id, &peer, limits.max_message_bytes) {
                            Ok(frame) => {
                                let delivered = membership.forward(&frame);
                                debug!(call_id = %call_id, peer = %peer, delivered, "frame relayed");
                            }
                            Err(e) => {
                                warn!(call_id = %call_id, peer = %peer, error = %e, "rejecting frame");
                                if sender.send(Message::Text(error_frame(&e))).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let e = SignalError::InvalidFrame("binary frames are not supported".to_string());
                        if sender.send(Message::Text(error_frame(&e))).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(call_id = %call_id, peer = %peer, "peer closed the socket");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(call_id = %call_id, peer = %peer, error = %e, "socket error");
                        break;
                    }
                }
            }

            frame = outbox.recv() => {
                let Some(frame) = frame else {
                    info!(call_id = %call_id, peer = %peer, "seat taken over by a newer connection");
                    break;
                };
                if sender.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if missed_pongs >= limits.max_missed_pongs {
                    info!(call_id = %call_id, peer = %peer, missed_pongs, "peer stopped answering pings");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                missed_pongs += 1;
            }
        }
    }

    drop(membership);
    let _ = sender.close().await;
}
