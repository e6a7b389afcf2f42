//! Peer connection management.
//!
//! [`PeerConnectionManager`] owns the single peer connection of a call. It sits
//! on top of a [`PeerTransport`] (the media engine) and enforces the ordering
//! rules the engine itself does not: one remote description per negotiation,
//! answers only after a local offer, and remote ICE candidates queued until a
//! remote description exists.
//!
//! Engine callbacks (local ICE candidates, remote tracks, connectivity) are
//! delivered as [`PeerEvent`]s on the channel passed to [`PeerBackend::open`].

use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{CallError, Result};
use crate::media::{MediaKind, MediaStreamHandle, MediaTrack, TrackId, TrackSource};

// ============================================================================
// Descriptors
// ============================================================================

/// Which side of the offer/answer exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// The initiating description.
    Offer,
    /// The response to an offer.
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => write!(f, "offer"),
            Self::Answer => write!(f, "answer"),
        }
    }
}

/// A session description exchanged over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer.
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// The SDP body.
    pub sdp: String,
}

impl SessionDescription {
    /// Creates an offer description.
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Creates an answer description.
    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A candidate network path for the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The candidate line.
    pub candidate: String,
    /// Media stream identification tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to.
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Creates a candidate bound to the first media section.
    #[must_use]
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }
}

/// A STUN or TURN server used for ICE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    /// Server URLs (`stun:`, `stuns:`, `turn:` or `turns:`).
    pub urls: Vec<String>,
    /// TURN username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A credential-less STUN server.
    #[must_use]
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// A track the remote peer is sending us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTrack {
    /// Remote track identifier.
    pub id: TrackId,
    /// Media kind.
    pub kind: MediaKind,
    /// Identifier of the inbound stream, for rendering.
    pub stream_id: String,
}

/// Asynchronous notifications from the media engine.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local candidate was discovered and must be forwarded to the peer.
    LocalCandidate(IceCandidate),
    /// The remote side added a track.
    RemoteTrack(RemoteTrack),
    /// A remote track ended.
    RemoteTrackEnded(TrackId),
    /// ICE connectivity established.
    Connected,
    /// The transport failed irrecoverably.
    Failed {
        /// Engine-provided reason.
        reason: String,
    },
}

/// Sender half given to the engine for [`PeerEvent`]s.
pub type PeerEvents = mpsc::UnboundedSender<PeerEvent>;

// ============================================================================
// Engine Seams
// ============================================================================

/// Factory for peer transports (the `create` step of a connection).
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Opens a new transport using `ice_servers`, reporting on `events`.
    async fn open(
        &self,
        ice_servers: &[IceServer],
        events: PeerEvents,
    ) -> Result<Box<dyn PeerTransport>>;
}

/// One engine-level peer connection.
#[async_trait]
pub trait PeerTransport: Send {
    /// Adds an outgoing track.
    async fn add_track(&mut self, track: &MediaTrack) -> Result<()>;
    /// Produces an offer for the current tracks.
    async fn create_offer(&mut self) -> Result<SessionDescription>;
    /// Produces an answer to the applied remote offer.
    async fn create_answer(&mut self) -> Result<SessionDescription>;
    /// Applies our own description.
    async fn set_local_description(&mut self, description: &SessionDescription) -> Result<()>;
    /// Applies the peer's description.
    async fn set_remote_description(&mut self, description: &SessionDescription) -> Result<()>;
    /// Applies a remote candidate. Only valid once a remote description is set.
    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()>;
    /// Swaps the outgoing video track without renegotiation; `None` sends nothing.
    async fn replace_video_track(&mut self, track: Option<&MediaTrack>) -> Result<()>;
    /// Releases transport resources.
    async fn close(&mut self);
}

// ============================================================================
// Manager
// ============================================================================

/// What happened to a remote candidate handed to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Applied to the transport.
    Applied,
    /// Held until a remote description is set.
    Queued,
    /// Rejected by the transport and discarded.
    Dropped,
}

/// Owns one peer connection and enforces negotiation ordering.
pub struct PeerConnectionManager {
    transport: Box<dyn PeerTransport>,
    local: Option<SdpKind>,
    remote: Option<SdpKind>,
    pending: VecDeque<IceCandidate>,
    camera: Option<MediaTrack>,
    outgoing_video: Option<MediaTrack>,
    closed: bool,
}

impl fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("pending", &self.pending.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl PeerConnectionManager {
    /// Opens a connection through `backend`.
    pub async fn create(
        backend: &dyn PeerBackend,
        ice_servers: &[IceServer],
        events: PeerEvents,
    ) -> Result<Self> {
        let transport = backend.open(ice_servers, events).await?;
        info!(ice_servers = ice_servers.len(), "peer connection created");
        Ok(Self {
            transport,
            local: None,
            remote: None,
            pending: VecDeque::new(),
            camera: None,
            outgoing_video: None,
            closed: false,
        })
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.closed {
            return Err(CallError::invalid_state(format!(
                "{operation} on a closed peer connection"
            )));
        }
        Ok(())
    }

    /// Attaches every live track of `media` as outgoing media.
    ///
    /// The camera track is remembered so screen sharing can restore it.
    pub async fn add_local_tracks(&mut self, media: &MediaStreamHandle) -> Result<usize> {
        self.ensure_open("adding local tracks")?;
        let mut added = 0;
        for track in media.tracks()?.iter().filter(|t| t.is_live()) {
            self.transport.add_track(track).await?;
            if track.source() == TrackSource::Camera {
                self.camera = Some(track.clone());
                self.outgoing_video = Some(track.clone());
            }
            added += 1;
        }
        debug!(added, "local tracks attached");
        Ok(added)
    }

    /// Creates an offer and applies it as the local description.
    pub async fn create_offer(&mut self) -> Result<SessionDescription> {
        self.ensure_open("creating an offer")?;
        if let Some(existing) = self.local {
            return Err(CallError::invalid_state(format!(
                "local {existing} already set; cannot create an offer"
            )));
        }
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(&offer).await?;
        self.local = Some(SdpKind::Offer);
        Ok(offer)
    }

    /// Creates an answer to the applied remote offer and applies it locally.
    pub async fn create_answer(&mut self) -> Result<SessionDescription> {
        self.ensure_open("creating an answer")?;
        if self.remote != Some(SdpKind::Offer) || self.local.is_some() {
            return Err(CallError::invalid_state(
                "an answer requires a remote offer and no local description",
            ));
        }
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(&answer).await?;
        self.local = Some(SdpKind::Answer);
        Ok(answer)
    }

    /// Applies the peer's description, then flushes queued candidates in
    /// arrival order.
    pub async fn apply_remote_description(&mut self, description: SessionDescription) -> Result<()> {
        self.ensure_open("applying a remote description")?;
        if let Some(existing) = self.remote {
            return Err(CallError::invalid_state(format!(
                "remote {existing} already applied; refusing remote {}",
                description.kind
            )));
        }
        match description.kind {
            SdpKind::Answer if self.local != Some(SdpKind::Offer) => {
                return Err(CallError::invalid_state(
                    "remote answer received before a local offer",
                ));
            }
            SdpKind::Offer if self.local.is_some() => {
                return Err(CallError::invalid_state(
                    "remote offer received after a local description was set",
                ));
            }
            _ => {}
        }

        self.transport.set_remote_description(&description).await?;
        self.remote = Some(description.kind);
        debug!(kind = %description.kind, queued = self.pending.len(), "remote description applied");
        self.flush_pending().await;
        Ok(())
    }

    async fn flush_pending(&mut self) {
        while let Some(candidate) = self.pending.pop_front() {
            if let Err(e) = self.transport.add_ice_candidate(&candidate).await {
                warn!(error = %e, "dropping queued ICE candidate");
            }
        }
    }

    /// Applies a remote candidate, or queues it if no remote description is set.
    pub async fn add_remote_ice_candidate(&mut self, candidate: IceCandidate) -> Result<CandidateOutcome> {
        self.ensure_open("adding a remote candidate")?;
        if self.remote.is_none() {
            self.pending.push_back(candidate);
            return Ok(CandidateOutcome::Queued);
        }
        match self.transport.add_ice_candidate(&candidate).await {
            Ok(()) => Ok(CandidateOutcome::Applied),
            Err(e) => {
                warn!(error = %e, "dropping remote ICE candidate");
                Ok(CandidateOutcome::Dropped)
            }
        }
    }

    /// Swaps the outgoing video track, keeping the previous one on failure.
    pub async fn replace_outgoing_video_track(&mut self, track: MediaTrack) -> Result<()> {
        self.ensure_open("replacing the video track")?;
        if track.kind() != MediaKind::Video {
            return Err(CallError::InvalidInput(format!(
                "cannot send a {} track as video",
                track.kind()
            )));
        }
        self.transport
            .replace_video_track(Some(&track))
            .await
            .map_err(CallError::track_replace_failed)?;
        self.outgoing_video = Some(track);
        Ok(())
    }

    /// Puts the original camera track back (or no video for audio-only calls).
    pub async fn restore_camera_track(&mut self) -> Result<()> {
        self.ensure_open("restoring the camera track")?;
        self.transport
            .replace_video_track(self.camera.as_ref())
            .await
            .map_err(CallError::track_replace_failed)?;
        self.outgoing_video.clone_from(&self.camera);
        Ok(())
    }

    /// Closes the connection. Returns `false` if it was already closed.
    pub async fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.pending.clear();
        self.transport.close().await;
        info!("peer connection closed");
        true
    }

    /// Returns `true` once closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns `true` once a local description is set.
    #[must_use]
    pub const fn has_local_description(&self) -> bool {
        self.local.is_some()
    }

    /// Returns `true` once a remote description is set.
    #[must_use]
    pub const fn has_remote_description(&self) -> bool {
        self.remote.is_some()
    }

    /// Number of remote candidates waiting for a remote description.
    #[must_use]
    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    /// The track currently sent as video.
    #[must_use]
    pub const fn outgoing_video(&self) -> Option<&MediaTrack> {
        self.outgoing_video.as_ref()
    }

    /// The original camera track.
    #[must_use]
    pub const fn camera_track(&self) -> Option<&MediaTrack> {
        self.camera.as_ref()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::{MediaConstraints, MediaProvider};
    use crate::synthetic::{SyntheticMedia, SyntheticPeerBackend};

    async fn manager(backend: &SyntheticPeerBackend) -> (PeerConnectionManager, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let servers = [IceServer::stun("stun:stun.example.org:3478")];
        let manager = PeerConnectionManager::create(backend, &servers, tx)
            .await
            .unwrap();
        (manager, rx)
    }

    // ------------------------------------------------------------------------
    // Description ordering tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_answer_before_local_offer_is_rejected() {
        let backend = SyntheticPeerBackend::new();
        let (mut peer, _events) = manager(&backend).await;

        let err = peer
            .apply_remote_description(SessionDescription::answer("v=0"))
            .await
            .unwrap_err();

        assert!(err.is_defect());
        assert!(!peer.has_remote_description());
    }

    #[tokio::test]
    async fn test_remote_description_twice_is_rejected() {
        let backend = SyntheticPeerBackend::new();
        let (mut peer, _events) = manager(&backend).await;

        peer.apply_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        let err = peer
            .apply_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_offer_answer_roundtrip_between_managers() {
        let backend = SyntheticPeerBackend::new();
        let (mut caller, _a) = manager(&backend).await;
        let (mut callee, _b) = manager(&backend).await;

        let offer = caller.create_offer().await.unwrap();
        callee.apply_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        caller.apply_remote_description(answer).await.unwrap();

        assert!(caller.has_local_description() && caller.has_remote_description());
        assert!(callee.has_local_description() && callee.has_remote_description());
    }

    #[tokio::test]
    async fn test_create_answer_without_offer_fails() {
        let backend = SyntheticPeerBackend::new();
        let (mut peer, _events) = manager(&backend).await;
        assert!(peer.create_answer().await.is_err());
    }

    // ------------------------------------------------------------------------
    // Candidate queue tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description_then_flush_in_order() {
        let backend = SyntheticPeerBackend::new();
        let (mut peer, _events) = manager(&backend).await;

        for n in 1..=3 {
            let outcome = peer
                .add_remote_ice_candidate(IceCandidate::new(format!("candidate:{n}")))
                .await
                .unwrap();
            assert_eq!(outcome, CandidateOutcome::Queued);
        }
        assert_eq!(peer.pending_candidates(), 3);
        assert!(backend.applied_candidates().is_empty());

        peer.apply_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();

        assert_eq!(peer.pending_candidates(), 0);
        let applied: Vec<String> = backend
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["candidate:1", "candidate:2", "candidate:3"]);

        let outcome = peer
            .add_remote_ice_candidate(IceCandidate::new("candidate:4"))
            .await
            .unwrap();
        assert_eq!(outcome, CandidateOutcome::Applied);
        assert_eq!(backend.applied_candidates().len(), 4);
    }

    // ------------------------------------------------------------------------
    // Track replacement tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_screen_share_swap_and_restore() {
        let backend = SyntheticPeerBackend::new();
        let media = SyntheticMedia::new();
        let (mut peer, _events) = manager(&backend).await;
        let handle = media.acquire(MediaConstraints::default()).await.unwrap();
        peer.add_local_tracks(&handle).await.unwrap();
        let camera = peer.camera_track().cloned().unwrap();

        let screen = media.acquire_display().await.unwrap();
        peer.replace_outgoing_video_track(screen.clone()).await.unwrap();
        assert_eq!(peer.outgoing_video().unwrap().id(), screen.id());

        peer.restore_camera_track().await.unwrap();
        let restored = peer.outgoing_video().unwrap();
        assert_eq!(restored.id(), camera.id());
        assert!(restored.same_configuration(&camera));
        assert!(!peer.is_closed());
    }

    #[tokio::test]
    async fn test_rejected_swap_keeps_previous_track() {
        let backend = SyntheticPeerBackend::new();
        let media = SyntheticMedia::new();
        let (mut peer, _events) = manager(&backend).await;
        let handle = media.acquire(MediaConstraints::default()).await.unwrap();
        peer.add_local_tracks(&handle).await.unwrap();
        let camera_id = peer.camera_track().unwrap().id().clone();

        backend.set_reject_track_replace(true);
        let screen = media.acquire_display().await.unwrap();
        let err = peer.replace_outgoing_video_track(screen).await.unwrap_err();

        assert!(matches!(err, CallError::TrackReplaceFailed { .. }));
        assert_eq!(peer.outgoing_video().unwrap().id(), &camera_id);
    }

    #[tokio::test]
    async fn test_audio_track_cannot_replace_video() {
        let backend = SyntheticPeerBackend::new();
        let (mut peer, _events) = manager(&backend).await;
        let mic = MediaTrack::new(TrackSource::Microphone, "Mic", None);
        assert!(matches!(
            peer.replace_outgoing_video_track(mic).await,
            Err(CallError::InvalidInput(_))
        ));
    }

    // ------------------------------------------------------------------------
    // Close tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let backend = SyntheticPeerBackend::new();
        let (mut peer, _events) = manager(&backend).await;
        assert_eq!(backend.open_connections(), 1);

        assert!(peer.close().await);
        assert!(!peer.close().await);
        assert_eq!(backend.open_connections(), 0);
        assert!(peer.create_offer().await.is_err());
    }
}
