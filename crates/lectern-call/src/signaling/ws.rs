//! WebSocket transport for the `lectern-signal` relay.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::{SignalingChannel, SignalingConnector, SignalingEvent, SignalingInbox, SignalingLink, SignalingMessage};
use crate::error::{CallError, Result};
use crate::participant::CallId;

/// Default bound on the WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to `{base}/ws/{callId}?peer={peerId}`.
#[derive(Debug, Clone)]
pub struct WsSignalingConnector {
    base_url: String,
    connect_timeout: Duration,
}

impl WsSignalingConnector {
    /// Creates a connector for the relay at `base_url` (`ws://` or `wss://`).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Overrides the handshake timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builds the room URL for `peer_id` in `call_id`.
    pub fn endpoint(&self, call_id: &CallId, peer_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| CallError::connect_failed(&self.base_url, e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(CallError::connect_failed(
                &self.base_url,
                "signaling URL must use ws:// or wss://",
            ));
        }
        url.path_segments_mut()
            .map_err(|()| CallError::connect_failed(&self.base_url, "URL cannot carry a path"))?
            .pop_if_empty()
            .push("ws")
            .push(call_id.as_str());
        url.query_pairs_mut().append_pair("peer", peer_id);
        Ok(url)
    }
}

#[async_trait]
impl SignalingConnector for WsSignalingConnector {
    async fn connect(
        &self,
        call_id: &CallId,
        peer_id: &str,
        inbox: SignalingInbox,
    ) -> Result<SignalingChannel> {
        let url = self.endpoint(call_id, peer_id)?;
        let target = url.to_string();

        let (ws, _response) =
            match tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(target.as_str())).await {
                Ok(Ok(connected)) => connected,
                Ok(Err(e)) => return Err(CallError::connect_failed(&target, e.to_string())),
                Err(_) => {
                    return Err(CallError::connect_failed(
                        &target,
                        format!("handshake timed out after {:?}", self.connect_timeout),
                    ))
                }
            };
        info!(call_id = %call_id, peer = %peer_id, "signaling connected");

        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_call = call_id.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => match SignalingMessage::decode(&text) {
                        Ok(message) => {
                            if inbox.send(SignalingEvent::Message(message)).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(call_id = %reader_call, error = %e, "skipping malformed signaling frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(
                            || "relay closed the connection".to_string(),
                            |f| f.reason.to_string(),
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "connection ended".to_string(),
                }
            };
            debug!(call_id = %reader_call, reason = %reason, "signaling transport lost");
            let _ = inbox.send(SignalingEvent::Closed { reason });
        });

        Ok(SignalingChannel::new(
            call_id.clone(),
            peer_id,
            Box::new(WsLink {
                outbound: Some(outbound),
                reader,
            }),
        ))
    }
}

struct WsLink {
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reader: JoinHandle<()>,
}

impl SignalingLink for WsLink {
    fn send(&self, message: &SignalingMessage) -> bool {
        let Some(outbound) = &self.outbound else {
            return false;
        };
        match message.encode() {
            Ok(text) => outbound.send(Message::Text(text)).is_ok(),
            Err(e) => {
                warn!(error = %e, "could not encode signaling frame");
                false
            }
        }
    }

    fn disconnect(&mut self) {
        self.reader.abort();
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Message::Close(None));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_builds_room_url() {
        let connector = WsSignalingConnector::new("ws://127.0.0.1:3030");
        let url = connector
            .endpoint(&CallId::from("call 7"), "alice")
            .unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:3030/ws/call%207?peer=alice");
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let connector = WsSignalingConnector::new("wss://example.org/signal/");
        let url = connector.endpoint(&CallId::from("c1"), "bob").unwrap();
        assert_eq!(url.as_str(), "wss://example.org/signal/ws/c1?peer=bob");
    }

    #[test]
    fn test_endpoint_rejects_http() {
        let connector = WsSignalingConnector::new("http://example.org");
        assert!(matches!(
            connector.endpoint(&CallId::from("c1"), "bob"),
            Err(CallError::ConnectFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_failed() {
        let connector = WsSignalingConnector::new("ws://127.0.0.1:1")
            .with_connect_timeout(Duration::from_secs(2));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = connector
            .connect(&CallId::from("c1"), "alice", tx)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::ConnectFailed { .. }));
    }
}
