//! Signaling: the out-of-band channel that carries offers, answers, ICE
//! candidates, chat and hang-ups between the two peers of a call.
//!
//! # Wire format
//!
//! One JSON object per frame:
//!
//! ```json
//! {"type": "offer", "callId": "c-1", "from": "alice", "payload": {"type": "offer", "sdp": "..."}}
//! ```
//!
//! `type` is one of `ready`, `offer`, `answer`, `ice-candidate`, `chat` or
//! `end`. Delivery is at-most-once and in order per direction.
//!
//! # Transports
//!
//! - [`WsSignalingConnector`]: WebSocket client for the `lectern-signal` relay.
//! - [`MemorySignalingHub`]: in-process rooms for tests and demos.

mod memory;
mod ws;

pub use memory::MemorySignalingHub;
pub use ws::WsSignalingConnector;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::chat::ChatMessage;
use crate::error::{CallError, Result};
use crate::participant::CallId;
use crate::peer::{IceCandidate, SdpKind, SessionDescription};

// ============================================================================
// Messages
// ============================================================================

/// The `type` tag of a signaling frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    /// The sender's channel is up and it can negotiate.
    Ready,
    /// Session description offer.
    Offer,
    /// Session description answer.
    Answer,
    /// One ICE candidate.
    IceCandidate,
    /// A chat line.
    Chat,
    /// Hang-up.
    End,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::Ready => "ready",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::Chat => "chat",
            Self::End => "end",
        };
        f.write_str(tag)
    }
}

/// Decoded payload of a signaling frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalBody {
    /// Channel up.
    Ready,
    /// Offer from the caller.
    Offer(SessionDescription),
    /// Answer from the callee.
    Answer(SessionDescription),
    /// A candidate path.
    IceCandidate(IceCandidate),
    /// A chat line.
    Chat(ChatMessage),
    /// The sender hung up.
    End {
        /// Free-form reason.
        reason: String,
    },
}

impl SignalBody {
    /// The wire tag of this body.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Ready => MessageType::Ready,
            Self::Offer(_) => MessageType::Offer,
            Self::Answer(_) => MessageType::Answer,
            Self::IceCandidate(_) => MessageType::IceCandidate,
            Self::Chat(_) => MessageType::Chat,
            Self::End { .. } => MessageType::End,
        }
    }
}

/// A signaling frame addressed to one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct SignalingMessage {
    /// Call the frame belongs to.
    pub call_id: CallId,
    /// Sender's peer id.
    pub from: String,
    /// Decoded payload.
    pub body: SignalBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "type")]
    kind: MessageType,
    call_id: CallId,
    #[serde(default)]
    from: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EndPayload {
    #[serde(default)]
    reason: String,
}

fn payload<T: serde::de::DeserializeOwned>(kind: MessageType, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| CallError::Protocol(format!("invalid {kind} payload: {e}")))
}

fn description(kind: MessageType, expected: SdpKind, value: Value) -> Result<SessionDescription> {
    let desc: SessionDescription = payload(kind, value)?;
    if desc.kind != expected {
        return Err(CallError::Protocol(format!(
            "{kind} frame carries an {} description",
            desc.kind
        )));
    }
    Ok(desc)
}

impl TryFrom<WireMessage> for SignalingMessage {
    type Error = CallError;

    fn try_from(wire: WireMessage) -> Result<Self> {
        let kind = wire.kind;
        let body = match kind {
            MessageType::Ready => SignalBody::Ready,
            MessageType::Offer => SignalBody::Offer(description(kind, SdpKind::Offer, wire.payload)?),
            MessageType::Answer => {
                SignalBody::Answer(description(kind, SdpKind::Answer, wire.payload)?)
            }
            MessageType::IceCandidate => SignalBody::IceCandidate(payload(kind, wire.payload)?),
            MessageType::Chat => SignalBody::Chat(payload(kind, wire.payload)?),
            MessageType::End => {
                let end: EndPayload = if wire.payload.is_null() {
                    EndPayload::default()
                } else {
                    payload(kind, wire.payload)?
                };
                SignalBody::End { reason: end.reason }
            }
        };
        Ok(Self {
            call_id: wire.call_id,
            from: wire.from,
            body,
        })
    }
}

impl From<SignalingMessage> for WireMessage {
    fn from(msg: SignalingMessage) -> Self {
        let kind = msg.body.message_type();
        let payload = match msg.body {
            SignalBody::Ready => Value::Null,
            SignalBody::Offer(desc) | SignalBody::Answer(desc) => {
                serde_json::to_value(desc).unwrap_or(Value::Null)
            }
            SignalBody::IceCandidate(candidate) => {
                serde_json::to_value(candidate).unwrap_or(Value::Null)
            }
            SignalBody::Chat(chat) => serde_json::to_value(chat).unwrap_or(Value::Null),
            SignalBody::End { reason } => {
                serde_json::to_value(EndPayload { reason }).unwrap_or(Value::Null)
            }
        };
        Self {
            kind,
            call_id: msg.call_id,
            from: msg.from,
            payload,
        }
    }
}

impl SignalingMessage {
    /// Creates a frame.
    #[must_use]
    pub fn new(call_id: CallId, from: impl Into<String>, body: SignalBody) -> Self {
        Self {
            call_id,
            from: from.into(),
            body,
        }
    }

    /// The wire tag.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Serializes to a JSON text frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a JSON text frame.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| CallError::Protocol(e.to_string()))
    }
}

// ============================================================================
// Channel Contract
// ============================================================================

/// What a transport delivers to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// An inbound frame, in arrival order.
    Message(SignalingMessage),
    /// The transport was lost. Not emitted after a local `disconnect`.
    Closed {
        /// Why the transport went away.
        reason: String,
    },
}

/// Where a transport delivers [`SignalingEvent`]s.
pub type SignalingInbox = mpsc::UnboundedSender<SignalingEvent>;

/// Transport half of a [`SignalingChannel`].
pub trait SignalingLink: Send {
    /// Hands a frame to the transport. Returns `false` if it could not.
    fn send(&self, message: &SignalingMessage) -> bool;

    /// Tears the transport down without reporting `Closed`.
    fn disconnect(&mut self);
}

/// An open signaling channel for one peer in one call.
pub struct SignalingChannel {
    call_id: CallId,
    peer_id: String,
    link: Box<dyn SignalingLink>,
    open: bool,
}

impl fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("call_id", &self.call_id)
            .field("peer_id", &self.peer_id)
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl SignalingChannel {
    /// Wraps a connected transport.
    #[must_use]
    pub fn new(call_id: CallId, peer_id: impl Into<String>, link: Box<dyn SignalingLink>) -> Self {
        Self {
            call_id,
            peer_id: peer_id.into(),
            link,
            open: true,
        }
    }

    /// Sends `body` stamped with this channel's call and peer id.
    ///
    /// Fire-and-forget: returns whether the transport accepted the frame.
    pub fn send(&self, body: SignalBody) -> bool {
        if !self.open {
            return false;
        }
        let message = SignalingMessage::new(self.call_id.clone(), self.peer_id.clone(), body);
        let sent = self.link.send(&message);
        if !sent {
            debug!(call_id = %self.call_id, kind = %message.message_type(), "signaling frame not sent");
        }
        sent
    }

    /// Closes the channel. Returns `false` if it was already closed.
    pub fn disconnect(&mut self) -> bool {
        if !self.open {
            return false;
        }
        self.open = false;
        self.link.disconnect();
        debug!(call_id = %self.call_id, peer = %self.peer_id, "signaling disconnected");
        true
    }

    /// Returns `true` until disconnected.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// The call this channel serves.
    #[must_use]
    pub const fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// The local peer id.
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Opens signaling channels.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Connects `peer_id` to the room of `call_id`, delivering inbound events
    /// to `inbox`.
    async fn connect(
        &self,
        call_id: &CallId,
        peer_id: &str,
        inbox: SignalingInbox,
    ) -> Result<SignalingChannel>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn call() -> CallId {
        CallId::from("call-1")
    }

    // ------------------------------------------------------------------------
    // Wire format tests
    // ------------------------------------------------------------------------

    #[test]
    fn test_offer_wire_format() {
        let msg = SignalingMessage::new(
            call(),
            "alice",
            SignalBody::Offer(SessionDescription::offer("v=0")),
        );
        let json: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        insta::assert_json_snapshot!(json, @r###"
        {
          "callId": "call-1",
          "from": "alice",
          "payload": {
            "sdp": "v=0",
            "type": "offer"
          },
          "type": "offer"
        }
        "###);
    }

    #[test]
    fn test_ice_candidate_wire_format() {
        let msg = SignalingMessage::new(
            call(),
            "bob",
            SignalBody::IceCandidate(IceCandidate::new("candidate:1 1 udp 1 192.0.2.1 5000 typ host")),
        );
        let json: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["payload"]["sdpMid"], "0");
        assert_eq!(json["payload"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_decode_end_without_payload() {
        let msg = SignalingMessage::decode(r#"{"type":"end","callId":"call-1","from":"bob"}"#)
            .unwrap();
        assert_eq!(
            msg.body,
            SignalBody::End {
                reason: String::new()
            }
        );
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = SignalingMessage::decode(r#"{"type":"renegotiate","callId":"c"}"#).unwrap_err();
        assert!(matches!(err, CallError::Protocol(_)));
    }

    #[test]
    fn test_decode_rejects_mismatched_description() {
        let err = SignalingMessage::decode(
            r#"{"type":"offer","callId":"c","payload":{"type":"answer","sdp":"v=0"}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("answer description"));
    }

    #[test]
    fn test_chat_roundtrip_preserves_message() {
        let chat = ChatMessage::new("alice", "hello");
        let msg = SignalingMessage::new(call(), "alice", SignalBody::Chat(chat.clone()));
        let decoded = SignalingMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.body, SignalBody::Chat(chat));
    }

    // ------------------------------------------------------------------------
    // Channel tests
    // ------------------------------------------------------------------------

    struct Recording {
        sent: std::sync::Arc<std::sync::Mutex<Vec<SignalingMessage>>>,
        disconnects: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl SignalingLink for Recording {
        fn send(&self, message: &SignalingMessage) -> bool {
            self.sent.lock().unwrap().push(message.clone());
            true
        }

        fn disconnect(&mut self) {
            self.disconnects
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_channel_stamps_and_disconnects_once() {
        let sent = std::sync::Arc::default();
        let disconnects = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut channel = SignalingChannel::new(
            call(),
            "alice",
            Box::new(Recording {
                sent: std::sync::Arc::clone(&sent),
                disconnects: std::sync::Arc::clone(&disconnects),
            }),
        );

        assert!(channel.send(SignalBody::Ready));
        assert!(channel.disconnect());
        assert!(!channel.disconnect());
        assert!(!channel.send(SignalBody::Ready));
        drop(channel);

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].from, "alice");
        assert_eq!(sent[0].call_id, call());
        assert_eq!(disconnects.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
