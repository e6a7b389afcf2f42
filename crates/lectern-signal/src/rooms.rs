//! Call rooms: who is connected to which call, and their outboxes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lectern_call::CallId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, SignalError};

#[derive(Debug)]
struct Member {
    conn_id: u64,
    peer_id: String,
    outbox: mpsc::Sender<String>,
}

#[derive(Debug, Default)]
struct Registry {
    next_conn: u64,
    rooms: HashMap<CallId, Vec<Member>>,
}

/// Shared room table. Cloning shares the same rooms.
#[derive(Debug, Clone)]
pub struct RoomRegistry {
    inner: Arc<Mutex<Registry>>,
    max_peers: usize,
}

impl RoomRegistry {
    /// Creates an empty registry admitting `max_peers` per room.
    #[must_use]
    pub fn new(max_peers: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry::default())),
            max_peers,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks that `peer_id` would get a seat, without taking one.
    ///
    /// A seat already held by the same peer id counts as free.
    pub fn admits(&self, call_id: &CallId, peer_id: &str) -> Result<()> {
        let registry = self.lock();
        let seated = registry
            .rooms
            .get(call_id)
            .map_or(0, |room| room.iter().filter(|m| m.peer_id != peer_id).count());
        if seated >= self.max_peers {
            return Err(SignalError::RoomFull {
                call_id: call_id.to_string(),
                max: self.max_peers,
            });
        }
        Ok(())
    }

    /// Admits `peer_id` to the room of `call_id`.
    ///
    /// A peer id that is still seated is replaced: the old connection's
    /// outbox closes and its socket loop ends. Returns the membership
    /// (leaving the room when dropped) and the receiver for frames forwarded
    /// to this peer.
    pub fn join(
        &self,
        call_id: &CallId,
        peer_id: &str,
        outbox_capacity: usize,
    ) -> Result<(Membership, mpsc::Receiver<String>)> {
        self.admits(call_id, peer_id)?;

        let (outbox, inbox) = mpsc::channel(outbox_capacity.max(1));
        let mut registry = self.lock();
        registry.next_conn += 1;
        let conn_id = registry.next_conn;

        let room = registry.rooms.entry(call_id.clone()).or_default();
        if let Some(index) = room.iter().position(|m| m.peer_id == peer_id) {
            let stale = room.remove(index);
            info!(call_id = %call_id, peer = %peer_id, stale_conn = stale.conn_id, "peer rejoined; replacing stale seat");
        }
        if room.len() >= self.max_peers {
            let err = SignalError::RoomFull {
                call_id: call_id.to_string(),
                max: self.max_peers,
            };
            if room.is_empty() {
                registry.rooms.remove(call_id);
            }
            return Err(err);
        }
        room.push(Member {
            conn_id,
            peer_id: peer_id.to_string(),
            outbox,
        });
        info!(call_id = %call_id, peer = %peer_id, members = room.len(), "peer joined room");
        drop(registry);

        Ok((
            Membership {
                rooms: self.clone(),
                call_id: call_id.clone(),
                peer_id: peer_id.to_string(),
                conn_id,
            },
            inbox,
        ))
    }

    fn leave(&self, call_id: &CallId, conn_id: u64) -> bool {
        let mut registry = self.lock();
        let Some(room) = registry.rooms.get_mut(call_id) else {
            return false;
        };
        let Some(index) = room.iter().position(|m| m.conn_id == conn_id) else {
            return false;
        };
        let member = room.remove(index);
        if room.is_empty() {
            registry.rooms.remove(call_id);
        }
        info!(call_id = %call_id, peer = %member.peer_id, "peer left room");
        true
    }

    /// Queues `frame` for every member of the room except `from_conn`.
    ///
    /// Returns how many outboxes accepted it. A full outbox drops the frame.
    fn forward(&self, call_id: &CallId, from_conn: u64, frame: &str) -> usize {
        let registry = self.lock();
        let Some(room) = registry.rooms.get(call_id) else {
            return 0;
        };
        let mut delivered = 0;
        for member in room.iter().filter(|m| m.conn_id != from_conn) {
            match member.outbox.try_send(frame.to_string()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(call_id = %call_id, peer = %member.peer_id, "outbox full; dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(call_id = %call_id, peer = %member.peer_id, "outbox closed");
                }
            }
        }
        delivered
    }

    /// Peer ids in the room, in join order; `None` when there is no room.
    #[must_use]
    pub fn peers(&self, call_id: &CallId) -> Option<Vec<String>> {
        self.lock()
            .rooms
            .get(call_id)
            .map(|room| room.iter().map(|m| m.peer_id.clone()).collect())
    }

    /// Number of non-empty rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    /// Configured room size.
    #[must_use]
    pub const fn max_peers(&self) -> usize {
        self.max_peers
    }
}

/// One connection's seat in a room. Dropping it leaves the room.
#[derive(Debug)]
pub struct Membership {
    rooms: RoomRegistry,
    call_id: CallId,
    peer_id: String,
    conn_id: u64,
}

impl Membership {
    /// The room's call id.
    #[must_use]
    pub const fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// The authenticated peer id.
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Forwards `frame` to the other members.
    pub fn forward(&self, frame: &str) -> usize {
        self.rooms.forward(&self.call_id, self.conn_id, frame)
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.rooms.leave(&self.call_id, self.conn_id);
    }
}
