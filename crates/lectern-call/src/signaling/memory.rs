//! In-process signaling rooms.
//!
//! Frames are delivered synchronously to the other members' inboxes, so a test
//! that sends and then drains an inbox sees the frame without yielding.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::{
    MessageType, SignalingChannel, SignalingConnector, SignalingEvent, SignalingInbox,
    SignalingLink, SignalingMessage,
};
use crate::error::{CallError, Result};
use crate::participant::CallId;

#[derive(Debug)]
struct Member {
    link_id: u64,
    peer_id: String,
    inbox: SignalingInbox,
}

#[derive(Debug)]
struct HubState {
    available: bool,
    next_link: u64,
    rooms: HashMap<CallId, Vec<Member>>,
    dropped: HashSet<MessageType>,
    delivered: usize,
}

impl Default for HubState {
    fn default() -> Self {
        Self {
            available: true,
            next_link: 0,
            rooms: HashMap::new(),
            dropped: HashSet::new(),
            delivered: 0,
        }
    }
}

impl HubState {
    fn remove(&mut self, call_id: &CallId, matches: impl Fn(&Member) -> bool) -> Option<Member> {
        let room = self.rooms.get_mut(call_id)?;
        let index = room.iter().position(matches)?;
        let member = room.remove(index);
        if room.is_empty() {
            self.rooms.remove(call_id);
        }
        Some(member)
    }
}

/// In-memory [`SignalingConnector`].
///
/// Cloning shares the same rooms.
#[derive(Debug, Clone, Default)]
pub struct MemorySignalingHub {
    state: Arc<Mutex<HubState>>,
}

impl MemorySignalingHub {
    /// Creates an empty, reachable hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// When `false`, new connections are refused with `ConnectFailed`.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Drops the member's transport as a network failure would: the member
    /// is removed and its inbox receives `Closed`. Returns `false` if no such
    /// member is connected.
    pub fn sever(&self, call_id: &CallId, peer_id: &str) -> bool {
        let removed = self.lock().remove(call_id, |m| m.peer_id == peer_id);
        match removed {
            Some(member) => {
                debug!(call_id = %call_id, peer = %peer_id, "memory signaling severed");
                let _ = member.inbox.send(SignalingEvent::Closed {
                    reason: "connection severed".to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Silently discards every future frame of `kind`.
    pub fn drop_messages(&self, kind: MessageType) {
        self.lock().dropped.insert(kind);
    }

    /// Peer ids connected to `call_id`, in join order.
    #[must_use]
    pub fn members(&self, call_id: &CallId) -> Vec<String> {
        self.lock()
            .rooms
            .get(call_id)
            .map(|room| room.iter().map(|m| m.peer_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Frames handed to at least one recipient.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.lock().delivered
    }
}

#[async_trait]
impl SignalingConnector for MemorySignalingHub {
    async fn connect(
        &self,
        call_id: &CallId,
        peer_id: &str,
        inbox: SignalingInbox,
    ) -> Result<SignalingChannel> {
        let link_id = {
            let mut state = self.lock();
            if !state.available {
                return Err(CallError::connect_failed(
                    format!("memory://{call_id}"),
                    "signaling hub unavailable",
                ));
            }
            let room = state.rooms.entry(call_id.clone()).or_default();
            if room.iter().any(|m| m.peer_id == peer_id) {
                return Err(CallError::connect_failed(
                    format!("memory://{call_id}"),
                    format!("peer '{peer_id}' is already connected"),
                ));
            }
            state.next_link += 1;
            let link_id = state.next_link;
            state
                .rooms
                .entry(call_id.clone())
                .or_default()
                .push(Member {
                    link_id,
                    peer_id: peer_id.to_string(),
                    inbox,
                });
            link_id
        };

        Ok(SignalingChannel::new(
            call_id.clone(),
            peer_id,
            Box::new(MemoryLink {
                hub: self.clone(),
                call_id: call_id.clone(),
                link_id,
            }),
        ))
    }
}

struct MemoryLink {
    hub: MemorySignalingHub,
    call_id: CallId,
    link_id: u64,
}

impl SignalingLink for MemoryLink {
    fn send(&self, message: &SignalingMessage) -> bool {
        let mut state = self.hub.lock();
        let Some(room) = state.rooms.get(&self.call_id) else {
            return false;
        };
        if !room.iter().any(|m| m.link_id == self.link_id) {
            return false;
        }
        if state.dropped.contains(&message.message_type()) {
            return true;
        }
        let mut reached = false;
        for member in room.iter().filter(|m| m.link_id != self.link_id) {
            reached |= member
                .inbox
                .send(SignalingEvent::Message(message.clone()))
                .is_ok();
        }
        if reached {
            state.delivered += 1;
        }
        true
    }

    fn disconnect(&mut self) {
        let link_id = self.link_id;
        self.hub.lock().remove(&self.call_id, |m| m.link_id == link_id);
    }
}
