//! Session event broadcasting.
//!
//! A [`CallSession`](crate::CallSession) publishes a [`CallEvent`] for every
//! transition, chat line, remote track and flag change. UIs subscribe through
//! [`EventBroadcaster::subscribe`].
//!
//! Events serialize as `{"event": "<name>", "payload": {...}}`:
//!
//! ```json
//! {"event": "state_changed", "payload": {"from": "negotiating", "to": "connected"}}
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::chat::ChatMessage;
use crate::error::ErrorKind;
use crate::peer::RemoteTrack;
use crate::session::{CallFlags, CallState};

/// Default per-subscriber buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Something observable happened in a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum CallEvent {
    /// The lifecycle state changed.
    StateChanged {
        /// Previous state.
        from: CallState,
        /// New state.
        to: CallState,
    },
    /// A chat line was appended (local or remote).
    Chat {
        /// The appended message.
        message: ChatMessage,
    },
    /// The remote peer added a track.
    RemoteTrack {
        /// The inbound track.
        track: RemoteTrack,
    },
    /// UI-facing flags changed.
    Flags {
        /// Current flags.
        flags: CallFlags,
    },
    /// The session failed or a recoverable operation was rejected.
    Error {
        /// Classification.
        kind: ErrorKind,
        /// Human-readable message.
        message: String,
    },
}

/// Fan-out of [`CallEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<CallEvent>,
}

impl EventBroadcaster {
    /// Creates a broadcaster buffering `capacity` events per subscriber.
    ///
    /// A subscriber that falls further behind receives `Lagged` and skips ahead.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Creates a new subscriber.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.sender.subscribe()
    }

    /// Publishes `event`, returning how many subscribers will see it.
    pub fn send(&self, event: CallEvent) -> usize {
        // Err only means nobody is listening.
        self.sender.send(event).unwrap_or(0)
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
