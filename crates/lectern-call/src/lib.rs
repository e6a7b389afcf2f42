//! Lectern Call Core
//!
//! Peer-to-peer video calls between two platform users: media acquisition,
//! the peer connection manager, signaling, the call session state machine,
//! in-call chat, and the video-call directory client.

pub mod chat;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod media;
pub mod participant;
pub mod peer;
pub mod poller;
pub mod session;
pub mod signaling;
pub mod synthetic;

pub use chat::{validate_text, ChatLog, ChatMessage};
pub use config::{CallConfig, MediaSettings, CONFIG_FILE_NAME};
pub use directory::{
    CallAction, CallDirectory, CallListing, CallStatus, NewVideoCall, VideoCallRecord,
};
pub use error::{CallError, ErrorKind, Result};
pub use events::{CallEvent, EventBroadcaster, DEFAULT_EVENT_CAPACITY};
pub use media::{
    MediaConstraints, MediaKind, MediaProvider, MediaStreamHandle, MediaTrack, TrackId,
    TrackSettings, TrackSource,
};
pub use participant::{CallId, CallRole, ParticipantInfo, PlatformRole};
pub use peer::{
    CandidateOutcome, IceCandidate, IceServer, PeerBackend, PeerConnectionManager, PeerEvent,
    PeerEvents, PeerTransport, RemoteTrack, SdpKind, SessionDescription,
};
pub use poller::{watch_incoming, watch_listing, Poller, PollerHandle};
pub use session::{
    CallCommand, CallDeps, CallFlags, CallSession, CallSnapshot, CallState, Failure, MediaFlags,
};
pub use signaling::{
    MemorySignalingHub, MessageType, SignalBody, SignalingChannel, SignalingConnector,
    SignalingEvent, SignalingInbox, SignalingLink, SignalingMessage, WsSignalingConnector,
};
pub use synthetic::{MediaFault, SyntheticMedia, SyntheticPeerBackend};
