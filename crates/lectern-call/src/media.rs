//! Media acquisition: capture constraints, tracks and stream handles.
//!
//! A [`MediaProvider`] turns [`MediaConstraints`] into a [`MediaStreamHandle`]
//! that exclusively owns the captured tracks. Releasing the handle stops every
//! track; the handle refuses further use afterwards.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CallError, Result};

// ============================================================================
// Kinds and Constraints
// ============================================================================

/// The two kinds of media a call carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Microphone audio.
    Audio,
    /// Camera or screen video.
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Where a track's samples come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    /// A microphone.
    Microphone,
    /// A camera.
    Camera,
    /// A captured screen or window.
    Screen,
}

impl TrackSource {
    /// Returns the media kind produced by this source.
    #[must_use]
    pub const fn kind(self) -> MediaKind {
        match self {
            Self::Microphone => MediaKind::Audio,
            Self::Camera | Self::Screen => MediaKind::Video,
        }
    }
}

/// Which media kinds to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture video from the camera.
    pub video: bool,
    /// Capture audio from the microphone.
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

impl MediaConstraints {
    /// Audio without video.
    #[must_use]
    pub const fn audio_only() -> Self {
        Self {
            video: false,
            audio: true,
        }
    }

    /// Video without audio.
    #[must_use]
    pub const fn video_only() -> Self {
        Self {
            video: true,
            audio: false,
        }
    }

    /// Returns `true` if `kind` is requested.
    #[must_use]
    pub const fn wants(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }

    /// Returns these constraints with `kind` removed.
    #[must_use]
    pub const fn without(self, kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self {
                audio: false,
                ..self
            },
            MediaKind::Video => Self {
                video: false,
                ..self
            },
        }
    }

    /// Returns `true` if nothing is requested.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.video && !self.audio
    }
}

// ============================================================================
// Tracks
// ============================================================================

/// Identifier of a single media track.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TrackId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capture configuration of a video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSettings {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frames per second.
    pub frame_rate: u32,
}

#[derive(Debug)]
struct TrackControl {
    live: AtomicBool,
    enabled: AtomicBool,
}

/// A single captured audio or video track.
///
/// Clones refer to the same underlying track: stopping one clone stops them
/// all, which is how a provider observes what its handles did.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: TrackId,
    source: TrackSource,
    label: String,
    settings: Option<TrackSettings>,
    control: Arc<TrackControl>,
}

impl MediaTrack {
    /// Creates a live, enabled track.
    #[must_use]
    pub fn new(source: TrackSource, label: impl Into<String>, settings: Option<TrackSettings>) -> Self {
        Self {
            id: TrackId::generate(),
            source,
            label: label.into(),
            settings,
            control: Arc::new(TrackControl {
                live: AtomicBool::new(true),
                enabled: AtomicBool::new(true),
            }),
        }
    }

    /// The track identifier.
    #[must_use]
    pub const fn id(&self) -> &TrackId {
        &self.id
    }

    /// The media kind.
    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.source.kind()
    }

    /// The capture source.
    #[must_use]
    pub const fn source(&self) -> TrackSource {
        self.source
    }

    /// Human-readable device label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Video capture settings, `None` for audio.
    #[must_use]
    pub const fn settings(&self) -> Option<TrackSettings> {
        self.settings
    }

    /// Returns `true` until the track is stopped.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.control.live.load(Ordering::Acquire)
    }

    /// Returns `true` if the track is producing (not muted).
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.control.enabled.load(Ordering::Acquire)
    }

    /// Mutes or unmutes the track without stopping capture.
    pub fn set_enabled(&self, enabled: bool) {
        self.control.enabled.store(enabled, Ordering::Release);
    }

    /// Stops capture. Returns `true` if the track was live.
    pub fn stop(&self) -> bool {
        self.control.live.swap(false, Ordering::AcqRel)
    }

    /// Returns `true` if `other` was captured with the same source and settings.
    #[must_use]
    pub fn same_configuration(&self, other: &Self) -> bool {
        self.source == other.source && self.settings == other.settings
    }
}

// ============================================================================
// Stream Handle
// ============================================================================

/// Exclusive ownership of the tracks captured for one call.
#[derive(Debug)]
pub struct MediaStreamHandle {
    tracks: Vec<MediaTrack>,
    released: bool,
}

impl MediaStreamHandle {
    /// Wraps freshly captured tracks.
    #[must_use]
    pub const fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            tracks,
            released: false,
        }
    }

    fn ensure_usable(&self, operation: &str) -> Result<()> {
        if self.released {
            return Err(CallError::invalid_state(format!(
                "{operation} on a released media handle"
            )));
        }
        Ok(())
    }

    /// All tracks owned by this handle.
    pub fn tracks(&self) -> Result<&[MediaTrack]> {
        self.ensure_usable("reading tracks")?;
        Ok(&self.tracks)
    }

    /// The first track of `kind`, if any.
    pub fn track(&self, kind: MediaKind) -> Result<Option<&MediaTrack>> {
        self.ensure_usable("reading a track")?;
        Ok(self.tracks.iter().find(|t| t.kind() == kind))
    }

    /// The camera track, if any.
    pub fn video_track(&self) -> Result<Option<&MediaTrack>> {
        self.track(MediaKind::Video)
    }

    /// Enables or disables every track of `kind`.
    ///
    /// Returns `false` if the handle has no track of that kind.
    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) -> Result<bool> {
        self.ensure_usable("toggling a track")?;
        let mut found = false;
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            found = true;
        }
        Ok(found)
    }

    /// Returns `true` if the handle owns a track of `kind`.
    #[must_use]
    pub fn has(&self, kind: MediaKind) -> bool {
        !self.released && self.tracks.iter().any(|t| t.kind() == kind)
    }

    /// Number of tracks still capturing.
    #[must_use]
    pub fn active_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    /// Returns `true` once [`release`](Self::release) has run.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.released
    }

    /// Stops every track and retires the handle.
    ///
    /// Returns the number of tracks stopped; a second call stops nothing.
    pub fn release(&mut self) -> usize {
        if self.released {
            return 0;
        }
        self.released = true;
        let stopped = self.tracks.iter().filter(|t| t.stop()).count();
        debug!(stopped, "media handle released");
        stopped
    }
}

impl Drop for MediaStreamHandle {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Provider
// ============================================================================

/// Source of captured media.
///
/// Implementations wrap the platform capture API. Errors must use
/// `PermissionDenied`, `DeviceNotFound` or `DeviceBusy` with the kind that
/// failed.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Starts capture for the requested kinds.
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStreamHandle>;

    /// Starts a screen capture track for screen sharing.
    async fn acquire_display(&self) -> Result<MediaTrack>;
}
