//! The call session state machine.
//!
//! A [`CallSession`] sequences media acquisition, signaling and the peer
//! connection into one call lifecycle:
//!
//! ```text
//! Idle -> AcquiringMedia -> AwaitingSignaling -> Negotiating -> Connected
//!                                                      Connected <-> Reconnecting
//! any non-terminal --end()--> Ending -> Ended
//! any non-terminal --fatal error--> Error --acknowledge()--> Ended
//! ```
//!
//! Resources live inside the current stage, so a `Connected` session always
//! has a peer connection and a signaling channel, and an `Ended` session has
//! neither. Every exit path (end, failure, drop) releases media, disconnects
//! signaling and closes the peer connection.
//!
//! The session is driven either by [`CallSession::run`], which waits on
//! signaling events, engine events, user commands and timers, or step by step
//! with [`CallSession::pump`] and [`CallSession::tick`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::chat::{validate_text, ChatLog, ChatMessage};
use crate::config::CallConfig;
use crate::error::{CallError, ErrorKind, Result};
use crate::events::{CallEvent, EventBroadcaster};
use crate::media::{MediaKind, MediaProvider, MediaStreamHandle, MediaTrack};
use crate::participant::{CallId, CallRole, ParticipantInfo};
use crate::peer::{
    IceCandidate, PeerBackend, PeerConnectionManager, PeerEvent, RemoteTrack, SessionDescription,
};
use crate::signaling::{
    SignalBody, SignalingChannel, SignalingConnector, SignalingEvent, SignalingMessage,
};

// ============================================================================
// Public State
// ============================================================================

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Created, nothing acquired.
    #[default]
    Idle,
    /// Waiting for camera/microphone access.
    AcquiringMedia,
    /// Media captured; connecting to signaling.
    AwaitingSignaling,
    /// Exchanging descriptions and candidates.
    Negotiating,
    /// Media is flowing.
    Connected,
    /// Signaling was lost after connecting; retrying within a window.
    Reconnecting,
    /// Releasing resources.
    Ending,
    /// Finished. Terminal.
    Ended,
    /// Failed. Leaves only to `Ended` through `acknowledge`.
    Error,
}

impl CallState {
    /// Returns `true` for `Ended`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ended)
    }

    /// Returns `true` once the session no longer progresses on its own.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Ended | Self::Error)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AcquiringMedia => "acquiring_media",
            Self::AwaitingSignaling => "awaiting_signaling",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Ending => "ending",
            Self::Ended => "ended",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Local media switches, orthogonal to the lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFlags {
    /// Camera track enabled.
    pub video_enabled: bool,
    /// Microphone track enabled.
    pub audio_enabled: bool,
    /// Screen capture is the outgoing video.
    pub screen_sharing: bool,
}

/// Flags the call UI renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFlags {
    /// The session is `Connected`.
    pub is_connected: bool,
    /// See [`MediaFlags::video_enabled`].
    pub is_video_enabled: bool,
    /// See [`MediaFlags::audio_enabled`].
    pub is_audio_enabled: bool,
    /// See [`MediaFlags::screen_sharing`].
    pub is_screen_sharing: bool,
    /// Local participant plus the remote one once its media arrived.
    pub participant_count: u32,
}

/// Why a session is in `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    /// Classification.
    pub kind: ErrorKind,
    /// Display text of the error.
    pub message: String,
}

/// Serializable view of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    /// Call id.
    pub call_id: CallId,
    /// Negotiation role.
    pub role: CallRole,
    /// Current state.
    pub state: CallState,
    /// UI flags.
    pub flags: CallFlags,
    /// Local participant.
    pub local: ParticipantInfo,
    /// Remote participant.
    pub remote: ParticipantInfo,
    /// Chat so far.
    pub chat: Vec<ChatMessage>,
    /// Every state entered, in order.
    pub history: Vec<CallState>,
    /// First time the call connected.
    pub started_at: Option<DateTime<Utc>>,
    /// When the call ended.
    pub ended_at: Option<DateTime<Utc>>,
    /// Failure, if any.
    pub error: Option<Failure>,
}

/// A user action delivered to [`CallSession::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallCommand {
    /// Mute or unmute the microphone.
    ToggleAudio,
    /// Disable or enable the camera.
    ToggleVideo,
    /// Start or stop screen sharing.
    ToggleScreenShare,
    /// Send a chat line.
    SendChat(String),
    /// Hang up.
    End(String),
    /// Dismiss a failure.
    Acknowledge,
}

/// Collaborators injected into a session.
#[derive(Clone)]
pub struct CallDeps {
    /// Camera/microphone/screen capture.
    pub media: Arc<dyn MediaProvider>,
    /// Peer connection factory.
    pub peers: Arc<dyn PeerBackend>,
    /// Signaling transport.
    pub signaling: Arc<dyn SignalingConnector>,
    /// Settings.
    pub config: CallConfig,
}

impl CallDeps {
    /// Bundles the collaborators.
    pub fn new(
        media: Arc<dyn MediaProvider>,
        peers: Arc<dyn PeerBackend>,
        signaling: Arc<dyn SignalingConnector>,
        config: CallConfig,
    ) -> Self {
        Self {
            media,
            peers,
            signaling,
            config,
        }
    }
}

impl fmt::Debug for CallDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallDeps")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Internal Stages
// ============================================================================

struct LiveCall {
    media: MediaStreamHandle,
    peer: PeerConnectionManager,
    screen: Option<MediaTrack>,
    pending_answer: Option<SessionDescription>,
    remote_tracks: Vec<RemoteTrack>,
    transport_up: bool,
}

impl LiveCall {
    const fn new(media: MediaStreamHandle, peer: PeerConnectionManager) -> Self {
        Self {
            media,
            peer,
            screen: None,
            pending_answer: None,
            remote_tracks: Vec::new(),
            transport_up: false,
        }
    }

    async fn shutdown(mut self) {
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        let stopped = self.media.release();
        self.peer.close().await;
        debug!(stopped, "live call resources released");
    }
}

struct Retry {
    window_ends: Instant,
    next_attempt: Instant,
    backoff: Duration,
    attempts: u32,
}

enum Due {
    Negotiation,
    WindowClosed(u32),
    Retry,
}

enum Stage {
    Idle,
    AcquiringMedia,
    AwaitingSignaling {
        media: MediaStreamHandle,
    },
    Negotiating {
        live: LiveCall,
        channel: SignalingChannel,
        deadline: Instant,
    },
    Connected {
        live: LiveCall,
        channel: SignalingChannel,
    },
    Reconnecting {
        live: LiveCall,
        retry: Retry,
    },
    Ending,
    Ended,
    Error,
}

impl Stage {
    const fn state(&self) -> CallState {
        match self {
            Self::Idle => CallState::Idle,
            Self::AcquiringMedia => CallState::AcquiringMedia,
            Self::AwaitingSignaling { .. } => CallState::AwaitingSignaling,
            Self::Negotiating { .. } => CallState::Negotiating,
            Self::Connected { .. } => CallState::Connected,
            Self::Reconnecting { .. } => CallState::Reconnecting,
            Self::Ending => CallState::Ending,
            Self::Ended => CallState::Ended,
            Self::Error => CallState::Error,
        }
    }

    const fn live(&self) -> Option<&LiveCall> {
        match self {
            Self::Negotiating { live, .. }
            | Self::Connected { live, .. }
            | Self::Reconnecting { live, .. } => Some(live),
            _ => None,
        }
    }

    fn parts(&mut self) -> Option<(&mut LiveCall, Option<&mut SignalingChannel>)> {
        match self {
            Self::Negotiating { live, channel, .. } | Self::Connected { live, channel } => {
                Some((live, Some(channel)))
            }
            Self::Reconnecting { live, .. } => Some((live, None)),
            _ => None,
        }
    }

    /// Releases everything the stage owns: media first, then signaling, then
    /// the peer connection.
    async fn release(self) {
        match self {
            Self::AwaitingSignaling { mut media } => {
                media.release();
            }
            Self::Negotiating {
                mut live,
                mut channel,
                ..
            }
            | Self::Connected {
                mut live,
                mut channel,
            } => {
                live.media.release();
                channel.disconnect();
                live.shutdown().await;
            }
            Self::Reconnecting { live, .. } => live.shutdown().await,
            Self::Idle | Self::AcquiringMedia | Self::Ending | Self::Ended | Self::Error => {}
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// One peer-to-peer call from the local participant's point of view.
///
/// A session is single-use: once `Ended`, build a new one for another attempt.
pub struct CallSession {
    id: CallId,
    role: CallRole,
    local: ParticipantInfo,
    remote: ParticipantInfo,
    stage: Stage,
    state: CallState,
    flags: MediaFlags,
    chat: ChatLog,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    history: Vec<CallState>,
    failure: Option<Failure>,
    events: EventBroadcaster,
    deps: CallDeps,
    signal_tx: mpsc::UnboundedSender<SignalingEvent>,
    signal_rx: mpsc::UnboundedReceiver<SignalingEvent>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl CallSession {
    /// Creates an idle session.
    pub fn new(
        id: CallId,
        role: CallRole,
        local: ParticipantInfo,
        remote: ParticipantInfo,
        deps: CallDeps,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            id,
            role,
            local,
            remote,
            stage: Stage::Idle,
            state: CallState::Idle,
            flags: MediaFlags::default(),
            chat: ChatLog::new(),
            started_at: None,
            ended_at: None,
            history: vec![CallState::Idle],
            failure: None,
            events: EventBroadcaster::default(),
            deps,
            signal_tx,
            signal_rx,
            peer_tx,
            peer_rx,
        }
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    /// The call id.
    #[must_use]
    pub const fn id(&self) -> &CallId {
        &self.id
    }

    /// Negotiation role.
    #[must_use]
    pub const fn role(&self) -> CallRole {
        self.role
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> CallState {
        self.state
    }

    /// Every state entered so far, starting with `Idle`.
    #[must_use]
    pub fn history(&self) -> &[CallState] {
        &self.history
    }

    /// Local media switches.
    #[must_use]
    pub const fn media_flags(&self) -> MediaFlags {
        self.flags
    }

    /// UI-facing flags.
    #[must_use]
    pub fn flags(&self) -> CallFlags {
        let remote_present = self
            .stage
            .live()
            .is_some_and(|live| !live.remote_tracks.is_empty());
        CallFlags {
            is_connected: self.state == CallState::Connected,
            is_video_enabled: self.flags.video_enabled,
            is_audio_enabled: self.flags.audio_enabled,
            is_screen_sharing: self.flags.screen_sharing,
            participant_count: 1 + u32::from(remote_present),
        }
    }

    /// Chat log.
    #[must_use]
    pub const fn chat(&self) -> &ChatLog {
        &self.chat
    }

    /// Tracks received from the remote peer.
    #[must_use]
    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        self.stage
            .live()
            .map_or(&[], |live| live.remote_tracks.as_slice())
    }

    /// Why the session failed, if it did.
    #[must_use]
    pub const fn error(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// Local participant.
    #[must_use]
    pub const fn local(&self) -> &ParticipantInfo {
        &self.local
    }

    /// Remote participant.
    #[must_use]
    pub const fn remote(&self) -> &ParticipantInfo {
        &self.remote
    }

    /// When the call first connected.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When the call ended.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Subscribes to session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Serializable view of the session.
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.id.clone(),
            role: self.role,
            state: self.state,
            flags: self.flags(),
            local: self.local.clone(),
            remote: self.remote.clone(),
            chat: self.chat.messages().to_vec(),
            history: self.history.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            error: self.failure.clone(),
        }
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    fn enter(&mut self, stage: Stage) {
        let from = self.state;
        let to = stage.state();
        self.stage = stage;
        self.state = to;
        self.history.push(to);
        match to {
            CallState::Connected if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            CallState::Ended => self.ended_at = Some(Utc::now()),
            _ => {}
        }
        info!(call_id = %self.id, from = %from, to = %to, "call state changed");
        self.events.send(CallEvent::StateChanged { from, to });
        self.publish_flags();
    }

    fn take_stage(&mut self) -> Stage {
        std::mem::replace(&mut self.stage, Stage::Idle)
    }

    fn publish_flags(&self) {
        self.events.send(CallEvent::Flags {
            flags: self.flags(),
        });
    }

    fn report(&self, err: &CallError) {
        self.events.send(CallEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    /// Routes a fatal error through cleanup into `Error`.
    async fn fail(&mut self, err: CallError) -> CallError {
        if self.state.is_settled() {
            return err;
        }
        if err.is_defect() {
            error!(call_id = %self.id, error = %err, "call aborted by a sequencing defect");
        } else {
            warn!(call_id = %self.id, error = %err, "call failed");
        }
        self.failure = Some(Failure {
            kind: err.kind(),
            message: err.to_string(),
        });
        self.report(&err);
        self.take_stage().release().await;
        self.flags.screen_sharing = false;
        self.enter(Stage::Error);
        err
    }

    /// `Ending -> Ended`, optionally telling the peer first.
    async fn wind_down(&mut self, notify: Option<&str>) {
        let stage = self.take_stage();
        if let (Some(reason), Stage::Negotiating { channel, .. } | Stage::Connected { channel, .. }) =
            (notify, &stage)
        {
            channel.send(SignalBody::End {
                reason: reason.to_string(),
            });
        }
        self.enter(Stage::Ending);
        stage.release().await;
        self.flags.screen_sharing = false;
        self.enter(Stage::Ended);
    }

    fn require_connected(&self) -> Result<()> {
        if self.state == CallState::Connected {
            Ok(())
        } else {
            Err(CallError::NotConnected { state: self.state })
        }
    }

    // ------------------------------------------------------------------------
    // Join
    // ------------------------------------------------------------------------

    /// Acquires media, connects signaling, opens the peer connection and
    /// starts negotiating.
    ///
    /// Failures move the session to `Error` (and are returned); only calling
    /// `join` outside `Idle` leaves the state untouched.
    pub async fn join(&mut self) -> Result<()> {
        if self.state != CallState::Idle {
            return Err(CallError::invalid_state(format!(
                "join requires an idle session (current state: {})",
                self.state
            )));
        }

        self.enter(Stage::AcquiringMedia);
        let media = match acquire_media(&self.deps, &self.id).await {
            Ok(media) => media,
            Err(e) => return Err(self.fail(e).await),
        };
        self.flags.video_enabled = media.has(MediaKind::Video);
        self.flags.audio_enabled = media.has(MediaKind::Audio);
        self.enter(Stage::AwaitingSignaling { media });

        let connected = self
            .deps
            .signaling
            .connect(&self.id, &self.local.peer_id, self.signal_tx.clone())
            .await;
        let mut channel = match connected {
            Ok(channel) => channel,
            Err(e) => return Err(self.fail(e).await),
        };

        let opened = PeerConnectionManager::create(
            self.deps.peers.as_ref(),
            &self.deps.config.ice_servers,
            self.peer_tx.clone(),
        )
        .await;
        let peer = match opened {
            Ok(peer) => peer,
            Err(e) => {
                channel.disconnect();
                return Err(self.fail(e).await);
            }
        };

        let media = match self.take_stage() {
            Stage::AwaitingSignaling { media } => media,
            other => {
                self.stage = other;
                return Err(CallError::invalid_state("media vanished while joining"));
            }
        };
        let deadline = deadline_after(self.deps.config.negotiation_timeout());
        self.enter(Stage::Negotiating {
            live: LiveCall::new(media, peer),
            channel,
            deadline,
        });

        if let Err(e) = self.start_negotiation().await {
            return Err(self.fail(e).await);
        }
        Ok(())
    }

    async fn start_negotiation(&mut self) -> Result<()> {
        let Stage::Negotiating { live, channel, .. } = &mut self.stage else {
            return Err(CallError::invalid_state("negotiation started outside Negotiating"));
        };
        let LiveCall { media, peer, .. } = live;
        peer.add_local_tracks(media).await?;
        channel.send(SignalBody::Ready);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------------

    /// Applies one signaling event.
    ///
    /// Frames for another call, and frames the current state has no use for,
    /// are ignored. Out-of-order frames from the peer are rejected with
    /// `Protocol`; local sequencing defects fail the call.
    pub async fn handle_signaling(&mut self, event: SignalingEvent) -> Result<()> {
        let result = match event {
            SignalingEvent::Message(message) => self.on_message(message).await,
            SignalingEvent::Closed { reason } => {
                self.on_signaling_lost(reason).await;
                Ok(())
            }
        };
        self.escalate(result).await
    }

    async fn escalate(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if e.is_call_fatal() => Err(self.fail(e).await),
            other => other,
        }
    }

    async fn on_message(&mut self, message: SignalingMessage) -> Result<()> {
        if message.call_id != self.id {
            debug!(call_id = %self.id, other = %message.call_id, "ignoring frame for another call");
            return Ok(());
        }
        if message.from == self.local.peer_id {
            return Ok(());
        }
        match message.body {
            SignalBody::Ready => self.on_ready().await,
            SignalBody::Offer(offer) => self.on_offer(offer).await,
            SignalBody::Answer(answer) => self.on_answer(answer).await,
            SignalBody::IceCandidate(candidate) => self.on_remote_candidate(candidate).await,
            SignalBody::Chat(chat) => {
                self.on_chat(&message.from, chat);
                Ok(())
            }
            SignalBody::End { reason } => {
                if !self.state.is_settled() && self.state != CallState::Idle {
                    info!(call_id = %self.id, reason = %reason, "peer ended the call");
                    self.wind_down(None).await;
                }
                Ok(())
            }
        }
    }

    async fn on_ready(&mut self) -> Result<()> {
        let role = self.role;
        let Stage::Negotiating { live, channel, .. } = &mut self.stage else {
            return Ok(());
        };
        match role {
            CallRole::Caller => {
                if live.peer.has_local_description() {
                    return Ok(());
                }
                let offer = live.peer.create_offer().await?;
                channel.send(SignalBody::Offer(offer));
                if let Some(answer) = live.pending_answer.take() {
                    debug!("applying answer buffered before the offer");
                    live.peer.apply_remote_description(answer).await?;
                }
            }
            CallRole::Callee => {
                if !live.peer.has_remote_description() {
                    channel.send(SignalBody::Ready);
                }
            }
        }
        self.promote_if_connected();
        Ok(())
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> Result<()> {
        if self.role == CallRole::Caller {
            return Err(CallError::Protocol("offer received by the caller".to_string()));
        }
        let state = self.state;
        let Stage::Negotiating { live, channel, .. } = &mut self.stage else {
            return Err(CallError::Protocol(format!("unexpected offer while {state}")));
        };
        live.peer.apply_remote_description(offer).await?;
        let answer = live.peer.create_answer().await?;
        channel.send(SignalBody::Answer(answer));
        self.promote_if_connected();
        Ok(())
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if self.role == CallRole::Callee {
            warn!(call_id = %self.id, "callee received an answer; dropping it");
            return Err(CallError::Protocol("answer received by the callee".to_string()));
        }
        let state = self.state;
        let Stage::Negotiating { live, .. } = &mut self.stage else {
            return Err(CallError::Protocol(format!("unexpected answer while {state}")));
        };
        if !live.peer.has_local_description() {
            if live.pending_answer.is_some() {
                return Err(CallError::Protocol("duplicate answer".to_string()));
            }
            debug!("answer arrived before the local offer; buffering");
            live.pending_answer = Some(answer);
            return Ok(());
        }
        live.peer.apply_remote_description(answer).await?;
        self.promote_if_connected();
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        let Some((live, _)) = self.stage.parts() else {
            return Ok(());
        };
        let outcome = live.peer.add_remote_ice_candidate(candidate).await?;
        debug!(?outcome, "remote ICE candidate handled");
        Ok(())
    }

    /// Records a chat line from the remote participant.
    ///
    /// The author is taken from the remote [`ParticipantInfo`]; the label in
    /// the payload is not trusted.
    fn on_chat(&mut self, from: &str, mut message: ChatMessage) {
        if self.stage.live().is_none() {
            return;
        }
        if from != self.remote.peer_id {
            warn!(call_id = %self.id, from = %from, "dropping chat from an unknown peer");
            return;
        }
        message.sender.clone_from(&self.remote.display_name);
        if self.chat.append(message.clone()) {
            self.events.send(CallEvent::Chat { message });
        }
    }

    async fn on_signaling_lost(&mut self, reason: String) {
        match self.state {
            CallState::Negotiating => {
                self.fail(CallError::connect_failed("signaling", reason)).await;
            }
            CallState::Connected => {
                let Stage::Connected { live, channel } = self.take_stage() else {
                    return;
                };
                drop(channel);
                let initial = self.deps.config.reconnect_initial_backoff();
                warn!(call_id = %self.id, reason = %reason, "signaling lost; reconnecting");
                self.enter(Stage::Reconnecting {
                    live,
                    retry: Retry {
                        window_ends: deadline_after(self.deps.config.reconnect_window()),
                        next_attempt: deadline_after(initial),
                        backoff: initial,
                        attempts: 0,
                    },
                });
            }
            _ => debug!(call_id = %self.id, state = %self.state, "signaling closed"),
        }
    }

    // ------------------------------------------------------------------------
    // Peer Events
    // ------------------------------------------------------------------------

    /// Applies one engine event.
    pub async fn handle_peer(&mut self, event: PeerEvent) -> Result<()> {
        let result = self.on_peer(event).await;
        self.escalate(result).await
    }

    async fn on_peer(&mut self, event: PeerEvent) -> Result<()> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                match self.stage.parts() {
                    Some((_, Some(channel))) => {
                        channel.send(SignalBody::IceCandidate(candidate));
                    }
                    _ => debug!("local candidate dropped; no signaling channel"),
                }
                Ok(())
            }
            PeerEvent::RemoteTrack(track) => {
                let Some((live, _)) = self.stage.parts() else {
                    return Ok(());
                };
                if live.remote_tracks.iter().any(|t| t.id == track.id) {
                    return Ok(());
                }
                live.remote_tracks.push(track.clone());
                self.events.send(CallEvent::RemoteTrack { track });
                self.publish_flags();
                Ok(())
            }
            PeerEvent::RemoteTrackEnded(id) => {
                let Some((live, _)) = self.stage.parts() else {
                    return Ok(());
                };
                live.remote_tracks.retain(|t| t.id != id);
                if self.state == CallState::Connected {
                    info!(call_id = %self.id, track = %id, "remote track ended");
                    self.wind_down(Some("remote media ended")).await;
                } else {
                    self.publish_flags();
                }
                Ok(())
            }
            PeerEvent::Connected => {
                if let Some((live, _)) = self.stage.parts() {
                    live.transport_up = true;
                }
                self.promote_if_connected();
                Ok(())
            }
            PeerEvent::Failed { reason } => {
                if self.stage.live().is_some() {
                    return Err(CallError::connect_failed("peer transport", reason));
                }
                Ok(())
            }
        }
    }

    fn promote_if_connected(&mut self) {
        let ready = matches!(
            &self.stage,
            Stage::Negotiating { live, .. }
                if live.transport_up && live.peer.has_remote_description()
        );
        if !ready {
            return;
        }
        if let Stage::Negotiating { live, channel, .. } = self.take_stage() {
            self.enter(Stage::Connected { live, channel });
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn next_deadline(&self) -> Option<Instant> {
        match &self.stage {
            Stage::Negotiating { deadline, .. } => Some(*deadline),
            Stage::Reconnecting { retry, .. } => Some(retry.next_attempt.min(retry.window_ends)),
            _ => None,
        }
    }

    /// Handles an expired negotiation deadline or reconnect timer.
    ///
    /// Returns `false` if nothing was due.
    pub async fn tick(&mut self) -> bool {
        let now = Instant::now();
        let due = match &self.stage {
            Stage::Negotiating { deadline, .. } if now >= *deadline => Due::Negotiation,
            Stage::Reconnecting { retry, .. } if now >= retry.window_ends => {
                Due::WindowClosed(retry.attempts)
            }
            Stage::Reconnecting { retry, .. } if now >= retry.next_attempt => Due::Retry,
            _ => return false,
        };
        match due {
            Due::Negotiation => {
                let secs = self.deps.config.negotiation_timeout_secs;
                self.fail(CallError::timeout("the peer connection to establish", secs))
                    .await;
            }
            Due::WindowClosed(attempts) => {
                warn!(call_id = %self.id, attempts, "reconnect window expired");
                self.wind_down(None).await;
            }
            Due::Retry => self.try_reconnect().await,
        }
        true
    }

    async fn try_reconnect(&mut self) {
        let attempt = self
            .deps
            .signaling
            .connect(&self.id, &self.local.peer_id, self.signal_tx.clone())
            .await;
        match attempt {
            Ok(channel) => match self.take_stage() {
                Stage::Reconnecting { live, retry } => {
                    info!(call_id = %self.id, attempts = retry.attempts + 1, "signaling re-established");
                    self.enter(Stage::Connected { live, channel });
                }
                other => self.stage = other,
            },
            Err(e) => {
                let max = self.deps.config.reconnect_max_backoff();
                if let Stage::Reconnecting { retry, .. } = &mut self.stage {
                    retry.attempts += 1;
                    retry.backoff = retry.backoff.saturating_mul(2).min(max);
                    retry.next_attempt = deadline_after(retry.backoff).min(retry.window_ends);
                    debug!(attempts = retry.attempts, backoff = ?retry.backoff, error = %e, "reconnect attempt failed");
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // User Operations
    // ------------------------------------------------------------------------

    /// Mutes or unmutes the microphone. Returns the new setting.
    pub fn toggle_audio(&mut self) -> Result<bool> {
        self.toggle_kind(MediaKind::Audio)
    }

    /// Disables or enables the camera. Returns the new setting.
    pub fn toggle_video(&mut self) -> Result<bool> {
        self.toggle_kind(MediaKind::Video)
    }

    fn toggle_kind(&mut self, kind: MediaKind) -> Result<bool> {
        self.require_connected()?;
        let current = match kind {
            MediaKind::Audio => self.flags.audio_enabled,
            MediaKind::Video => self.flags.video_enabled,
        };
        let Some(live) = self.stage.live() else {
            return Err(CallError::NotConnected { state: self.state });
        };
        if !live.media.set_enabled(kind, !current)? {
            return Err(CallError::InvalidInput(format!("this call has no {kind} track")));
        }
        match kind {
            MediaKind::Audio => self.flags.audio_enabled = !current,
            MediaKind::Video => self.flags.video_enabled = !current,
        }
        self.publish_flags();
        Ok(!current)
    }

    /// Starts or stops screen sharing. Returns whether sharing is now on.
    ///
    /// A rejected swap returns `TrackReplaceFailed`; the call continues with
    /// the previous outgoing track.
    pub async fn toggle_screen_share(&mut self) -> Result<bool> {
        self.require_connected()?;
        let result = self.swap_screen().await;
        if let Err(e) = &result {
            warn!(call_id = %self.id, error = %e, "screen share toggle failed");
            self.report(e);
        }
        result
    }

    async fn swap_screen(&mut self) -> Result<bool> {
        let Stage::Connected { live, .. } = &mut self.stage else {
            return Err(CallError::NotConnected { state: self.state });
        };
        if let Some(screen) = live.screen.take() {
            if let Err(e) = live.peer.restore_camera_track().await {
                live.screen = Some(screen);
                return Err(e);
            }
            screen.stop();
            self.flags.screen_sharing = false;
        } else {
            let screen = self.deps.media.acquire_display().await?;
            if let Err(e) = live.peer.replace_outgoing_video_track(screen.clone()).await {
                screen.stop();
                return Err(e);
            }
            live.screen = Some(screen);
            self.flags.screen_sharing = true;
        }
        self.publish_flags();
        Ok(self.flags.screen_sharing)
    }

    /// Sends a chat line to the peer.
    ///
    /// The line is appended to the local log before it is handed to
    /// signaling; delivery is best effort.
    pub fn send_chat(&mut self, text: &str) -> Result<ChatMessage> {
        self.require_connected()?;
        validate_text(text, self.deps.config.chat_max_length)?;
        let message = ChatMessage::new(self.local.display_name.clone(), text);
        self.chat.append(message.clone());
        self.events.send(CallEvent::Chat {
            message: message.clone(),
        });
        if let Stage::Connected { channel, .. } = &self.stage {
            if !channel.send(SignalBody::Chat(message.clone())) {
                warn!(call_id = %self.id, "chat message could not be handed to signaling");
            }
        }
        Ok(message)
    }

    /// Hangs up and releases everything. Idempotent once `Ended`.
    pub async fn end(&mut self, reason: &str) {
        match self.state {
            CallState::Ended => {}
            CallState::Error => {
                self.enter(Stage::Ended);
            }
            _ => {
                info!(call_id = %self.id, reason = %reason, "ending call");
                self.wind_down(Some(reason)).await;
            }
        }
    }

    /// Dismisses a failure: `Error -> Ended`.
    pub fn acknowledge(&mut self) -> Result<()> {
        match self.state {
            CallState::Error => {
                self.enter(Stage::Ended);
                Ok(())
            }
            CallState::Ended => Ok(()),
            state => Err(CallError::invalid_state(format!(
                "nothing to acknowledge while {state}"
            ))),
        }
    }

    /// Applies one user command.
    pub async fn apply(&mut self, command: CallCommand) -> Result<()> {
        match command {
            CallCommand::ToggleAudio => self.toggle_audio().map(|_| ()),
            CallCommand::ToggleVideo => self.toggle_video().map(|_| ()),
            CallCommand::ToggleScreenShare => self.toggle_screen_share().await.map(|_| ()),
            CallCommand::SendChat(text) => self.send_chat(&text).map(|_| ()),
            CallCommand::End(reason) => {
                self.end(&reason).await;
                Ok(())
            }
            CallCommand::Acknowledge => self.acknowledge(),
        }
    }

    // ------------------------------------------------------------------------
    // Drivers
    // ------------------------------------------------------------------------

    /// Handles every event already queued, without waiting.
    ///
    /// Returns how many events were handled.
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        loop {
            if let Ok(event) = self.signal_rx.try_recv() {
                if let Err(e) = self.handle_signaling(event).await {
                    debug!(error = %e, "signaling event rejected");
                }
            } else if let Ok(event) = self.peer_rx.try_recv() {
                if let Err(e) = self.handle_peer(event).await {
                    debug!(error = %e, "peer event rejected");
                }
            } else {
                return handled;
            }
            handled += 1;
        }
    }

    /// Drives the session until it settles in `Ended` or `Error`.
    ///
    /// Joins first when idle. Closing `commands` ends the call.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<CallCommand>) -> CallState {
        if self.state == CallState::Idle {
            if let Err(e) = self.join().await {
                debug!(error = %e, "join failed");
            }
        }

        let mut commands_open = true;
        while !self.state.is_settled() {
            let deadline = self.next_deadline();
            tokio::select! {
                Some(event) = self.signal_rx.recv() => {
                    if let Err(e) = self.handle_signaling(event).await {
                        debug!(error = %e, "signaling event rejected");
                    }
                }
                Some(event) = self.peer_rx.recv() => {
                    if let Err(e) = self.handle_peer(event).await {
                        debug!(error = %e, "peer event rejected");
                    }
                }
                command = commands.recv(), if commands_open => match command {
                    Some(command) => {
                        if let Err(e) = self.apply(command).await {
                            warn!(call_id = %self.id, error = %e, "command rejected");
                            if !self.state.is_settled() {
                                self.report(&e);
                            }
                        }
                    }
                    None => {
                        commands_open = false;
                        self.end("call closed by the application").await;
                    }
                },
                () = wait_until(deadline) => {
                    self.tick().await;
                }
            }
        }
        self.state
    }
}

/// Captures the configured media, dropping a missing device's kind when
/// partial calls are allowed.
async fn acquire_media(deps: &CallDeps, call_id: &CallId) -> Result<MediaStreamHandle> {
    let settings = deps.config.media;
    let constraints = settings.constraints();
    match deps.media.acquire(constraints).await {
        Err(CallError::DeviceNotFound { kind })
            if settings.allow_partial && !constraints.without(kind).is_empty() =>
        {
            warn!(call_id = %call_id, missing = %kind, "joining without {kind}");
            deps.media.acquire(constraints.without(kind)).await
        }
        other => other,
    }
}

/// Stand-in for deadlines too far out to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + delay`, clamped to [`FAR_FUTURE`] instead of overflowing.
fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
