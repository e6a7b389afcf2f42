//! Synthetic media and peer backends.
//!
//! These implement [`MediaProvider`] and [`PeerBackend`] without hardware or a
//! media engine. They produce deterministic tracks and SDP, record what the
//! session did with them, and can be told to fail. The CLI `probe` command and
//! the test suites run calls on top of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{CallError, Result};
use crate::media::{
    MediaConstraints, MediaKind, MediaProvider, MediaStreamHandle, MediaTrack, TrackId,
    TrackSettings, TrackSource,
};
use crate::peer::{
    IceCandidate, IceServer, PeerBackend, PeerEvent, PeerEvents, PeerTransport, RemoteTrack,
    SdpKind, SessionDescription,
};

const CAMERA_SETTINGS: TrackSettings = TrackSettings {
    width: 1280,
    height: 720,
    frame_rate: 30,
};

const SCREEN_SETTINGS: TrackSettings = TrackSettings {
    width: 1920,
    height: 1080,
    frame_rate: 15,
};

// ============================================================================
// Media
// ============================================================================

/// A capture failure to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFault {
    /// Access denied.
    PermissionDenied,
    /// No such device.
    NotFound,
    /// Device held elsewhere.
    Busy,
}

impl MediaFault {
    const fn into_error(self, kind: MediaKind) -> CallError {
        match self {
            Self::PermissionDenied => CallError::PermissionDenied { kind },
            Self::NotFound => CallError::DeviceNotFound { kind },
            Self::Busy => CallError::DeviceBusy { kind },
        }
    }
}

#[derive(Debug, Default)]
struct MediaState {
    faults: HashMap<MediaKind, MediaFault>,
    display_fault: Option<MediaFault>,
    issued: Vec<MediaTrack>,
    acquisitions: usize,
}

/// In-memory [`MediaProvider`] with injectable faults.
#[derive(Debug, Clone, Default)]
pub struct SyntheticMedia {
    state: Arc<Mutex<MediaState>>,
}

impl SyntheticMedia {
    /// Creates a provider where every device is available.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes acquisition of `kind` fail with `fault`.
    #[must_use]
    pub fn with_fault(self, kind: MediaKind, fault: MediaFault) -> Self {
        self.set_fault(kind, Some(fault));
        self
    }

    /// Sets or clears the fault for `kind`.
    pub fn set_fault(&self, kind: MediaKind, fault: Option<MediaFault>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match fault {
            Some(fault) => state.faults.insert(kind, fault),
            None => state.faults.remove(&kind),
        };
    }

    /// Sets or clears the fault for screen capture.
    pub fn set_display_fault(&self, fault: Option<MediaFault>) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .display_fault = fault;
    }

    /// Number of issued tracks that are still capturing.
    #[must_use]
    pub fn active_tracks(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .issued
            .iter()
            .filter(|t| t.is_live())
            .count()
    }

    /// Number of successful `acquire` calls.
    #[must_use]
    pub fn acquisitions(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .acquisitions
    }
}

#[async_trait]
impl MediaProvider for SyntheticMedia {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStreamHandle> {
        if constraints.is_empty() {
            return Err(CallError::invalid_state(
                "media acquisition requires at least one kind",
            ));
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for kind in [MediaKind::Video, MediaKind::Audio] {
            if let Some(fault) = constraints.wants(kind).then(|| state.faults.get(&kind)).flatten() {
                return Err(fault.into_error(kind));
            }
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackSource::Microphone, "Synthetic Microphone", None));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(
                TrackSource::Camera,
                "Synthetic Camera",
                Some(CAMERA_SETTINGS),
            ));
        }
        state.issued.extend(tracks.iter().cloned());
        state.acquisitions += 1;
        debug!(tracks = tracks.len(), "synthetic media acquired");
        Ok(MediaStreamHandle::new(tracks))
    }

    async fn acquire_display(&self) -> Result<MediaTrack> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(fault) = state.display_fault {
            return Err(fault.into_error(MediaKind::Video));
        }
        let track = MediaTrack::new(TrackSource::Screen, "Synthetic Screen", Some(SCREEN_SETTINGS));
        state.issued.push(track.clone());
        Ok(track)
    }
}

// ============================================================================
// Peer Backend
// ============================================================================

#[derive(Debug, Default)]
struct BackendShared {
    opened: AtomicUsize,
    open: AtomicUsize,
    reject_track_replace: AtomicBool,
    applied: Mutex<Vec<IceCandidate>>,
    listeners: Mutex<Vec<PeerEvents>>,
}

/// In-memory [`PeerBackend`].
///
/// Descriptions list one `m=<kind> <track-id>` line per outgoing track and an
/// `a=stream:<id>` line; applying the peer's description reports one remote
/// track per `m=` line. Setting a local description yields two host
/// candidates. `Connected` is reported once both descriptions are set.
#[derive(Debug, Clone, Default)]
pub struct SyntheticPeerBackend {
    shared: Arc<BackendShared>,
}

impl SyntheticPeerBackend {
    /// Creates a backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent video track swap fail.
    pub fn set_reject_track_replace(&self, reject: bool) {
        self.shared
            .reject_track_replace
            .store(reject, Ordering::Release);
    }

    /// Transports opened over the backend's lifetime.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::Acquire)
    }

    /// Transports opened and not yet closed.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Remote candidates applied to any transport, in order.
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.shared
            .applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Injects an engine event into every transport opened so far.
    pub fn emit(&self, event: &PeerEvent) {
        let listeners = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            let _ = listener.send(event.clone());
        }
    }
}

#[async_trait]
impl PeerBackend for SyntheticPeerBackend {
    async fn open(
        &self,
        ice_servers: &[IceServer],
        events: PeerEvents,
    ) -> Result<Box<dyn PeerTransport>> {
        if ice_servers.is_empty() {
            return Err(CallError::connect_failed(
                "peer transport",
                "no ICE servers configured",
            ));
        }
        self.shared.opened.fetch_add(1, Ordering::AcqRel);
        self.shared.open.fetch_add(1, Ordering::AcqRel);
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(events.clone());

        Ok(Box::new(SyntheticTransport {
            shared: Arc::clone(&self.shared),
            events,
            stream_id: uuid::Uuid::new_v4().to_string(),
            tracks: Vec::new(),
            local: None,
            remote: None,
            connected: false,
            closed: false,
        }))
    }
}

struct SyntheticTransport {
    shared: Arc<BackendShared>,
    events: PeerEvents,
    stream_id: String,
    tracks: Vec<MediaTrack>,
    local: Option<SdpKind>,
    remote: Option<SdpKind>,
    connected: bool,
    closed: bool,
}

impl SyntheticTransport {
    fn describe(&self, kind: SdpKind) -> SessionDescription {
        let mut sdp = format!("v=0\r\na=stream:{}\r\n", self.stream_id);
        for track in &self.tracks {
            sdp.push_str(&format!("m={} {}\r\n", track.kind(), track.id()));
        }
        SessionDescription { kind, sdp }
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn check_connected(&mut self) {
        if !self.connected && self.local.is_some() && self.remote.is_some() {
            self.connected = true;
            self.emit(PeerEvent::Connected);
        }
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.open.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

fn parse_remote_tracks(sdp: &str) -> Vec<RemoteTrack> {
    let stream_id = sdp
        .lines()
        .find_map(|line| line.strip_prefix("a=stream:"))
        .unwrap_or("remote")
        .to_string();
    sdp.lines()
        .filter_map(|line| line.strip_prefix("m="))
        .filter_map(|rest| {
            let (kind, id) = rest.split_once(' ')?;
            let kind = match kind {
                "audio" => MediaKind::Audio,
                "video" => MediaKind::Video,
                _ => return None,
            };
            Some(RemoteTrack {
                id: TrackId::from(id.trim()),
                kind,
                stream_id: stream_id.clone(),
            })
        })
        .collect()
}

#[async_trait]
impl PeerTransport for SyntheticTransport {
    async fn add_track(&mut self, track: &MediaTrack) -> Result<()> {
        self.tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription> {
        Ok(self.describe(SdpKind::Offer))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription> {
        if self.remote != Some(SdpKind::Offer) {
            return Err(CallError::invalid_state("no remote offer to answer"));
        }
        Ok(self.describe(SdpKind::Answer))
    }

    async fn set_local_description(&mut self, description: &SessionDescription) -> Result<()> {
        self.local = Some(description.kind);
        for n in 1..=2 {
            self.emit(PeerEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{n} 1 udp 2122260223 192.0.2.{n} 5400{n} typ host"
            ))));
        }
        self.check_connected();
        Ok(())
    }

    async fn set_remote_description(&mut self, description: &SessionDescription) -> Result<()> {
        self.remote = Some(description.kind);
        for track in parse_remote_tracks(&description.sdp) {
            self.emit(PeerEvent::RemoteTrack(track));
        }
        self.check_connected();
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()> {
        if self.remote.is_none() {
            return Err(CallError::invalid_state(
                "candidate applied before the remote description",
            ));
        }
        self.shared
            .applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(candidate.clone());
        Ok(())
    }

    async fn replace_video_track(&mut self, track: Option<&MediaTrack>) -> Result<()> {
        if self.shared.reject_track_replace.load(Ordering::Acquire) {
            return Err(CallError::Protocol(
                "sender rejected the replacement track".to_string(),
            ));
        }
        self.tracks.retain(|t| t.kind() != MediaKind::Video);
        if let Some(track) = track {
            self.tracks.push(track.clone());
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl Drop for SyntheticTransport {
    fn drop(&mut self) {
        self.release();
    }
}
