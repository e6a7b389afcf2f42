//! Error types for Lectern call sessions.
//!
//! This module defines the error hierarchy for every call operation: media
//! acquisition, peer negotiation, signaling, chat, configuration loading and
//! the video-call directory client.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::media::MediaKind;
use crate::session::CallState;

/// A specialized `Result` type for call operations.
pub type Result<T> = std::result::Result<T, CallError>;

/// Errors that can occur while setting up or running a call.
///
/// Variants that the user can act on carry a `Suggestion` line in their
/// display output.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    // ========================================================================
    // Media Acquisition Errors
    // ========================================================================
    /// The user or the platform denied access to a capture device.
    #[error("Permission to capture {kind} was denied\n\nSuggestion: Allow {kind} access in your browser or system settings, then join the call again")]
    PermissionDenied {
        /// Media kind whose device was denied.
        kind: MediaKind,
    },

    /// No device matching the requested media kind exists.
    #[error("No {kind} capture device was found\n\nSuggestion: Connect a device, or join without {kind}")]
    DeviceNotFound {
        /// Media kind without a device.
        kind: MediaKind,
    },

    /// The device exists but another process holds it.
    #[error("The {kind} capture device is busy\n\nSuggestion: Close other applications using the device and retry")]
    DeviceBusy {
        /// Media kind whose device is busy.
        kind: MediaKind,
    },

    // ========================================================================
    // Signaling and Negotiation Errors
    // ========================================================================
    /// The signaling channel or the peer transport could not be established.
    #[error("Could not connect to '{target}': {message}\n\nSuggestion: Check your network connection and the signalingUrl setting")]
    ConnectFailed {
        /// What we tried to reach (URL or transport name).
        target: String,
        /// Description of the failure.
        message: String,
    },

    /// A bounded wait expired.
    #[error("Timed out after {secs}s waiting for {waiting_for}")]
    Timeout {
        /// What the session was waiting for.
        waiting_for: String,
        /// The configured bound in seconds.
        secs: u64,
    },

    /// An operation was invoked out of sequence.
    ///
    /// This indicates a defect in the caller or in the session wiring.
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Description of the sequencing violation.
        message: String,
    },

    /// The engine rejected an outgoing video track swap.
    #[error("Could not replace the outgoing video track: {message}")]
    TrackReplaceFailed {
        /// Description of the rejection.
        message: String,
    },

    /// The operation requires a connected call.
    #[error("Call is not connected (current state: {state})")]
    NotConnected {
        /// The state the session was in.
        state: CallState,
    },

    /// User-supplied input was rejected.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A signaling frame could not be interpreted.
    #[error("Protocol error: {0}")]
    Protocol(String),

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in a configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your lectern.json with a JSON linter")]
    ConfigParse {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    // ========================================================================
    // Directory (REST) Errors
    // ========================================================================
    /// Transport-level HTTP failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Message extracted from the response body.
        message: String,
    },

    // ========================================================================
    // General Errors
    // ========================================================================
    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of a [`CallError`], kept on a session after failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`CallError::PermissionDenied`].
    PermissionDenied,
    /// See [`CallError::DeviceNotFound`].
    DeviceNotFound,
    /// See [`CallError::DeviceBusy`].
    DeviceBusy,
    /// See [`CallError::ConnectFailed`].
    ConnectFailed,
    /// See [`CallError::InvalidState`].
    InvalidState,
    /// See [`CallError::TrackReplaceFailed`].
    TrackReplaceFailed,
    /// See [`CallError::NotConnected`].
    NotConnected,
    /// See [`CallError::Timeout`].
    Timeout,
    /// Anything else.
    Other,
}

impl CallError {
    /// Creates a new `ConnectFailed` error.
    #[must_use]
    pub fn connect_failed(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectFailed {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout(waiting_for: impl Into<String>, secs: u64) -> Self {
        Self::Timeout {
            waiting_for: waiting_for.into(),
            secs,
        }
    }

    /// Creates a new `InvalidState` error.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a new `TrackReplaceFailed` error.
    #[must_use]
    pub fn track_replace_failed(message: impl std::fmt::Display) -> Self {
        Self::TrackReplaceFailed {
            message: message.to_string(),
        }
    }

    /// Creates a new `ConfigParse` error with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidation` error with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `Api` error.
    #[must_use]
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Returns the coarse kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            Self::DeviceBusy { .. } => ErrorKind::DeviceBusy,
            Self::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::TrackReplaceFailed { .. } => ErrorKind::TrackReplaceFailed,
            Self::NotConnected { .. } => ErrorKind::NotConnected,
            Self::Timeout { .. } => ErrorKind::Timeout,
            _ => ErrorKind::Other,
        }
    }

    /// Returns the media kind for device errors.
    #[must_use]
    pub const fn media_kind(&self) -> Option<MediaKind> {
        match self {
            Self::PermissionDenied { kind }
            | Self::DeviceNotFound { kind }
            | Self::DeviceBusy { kind } => Some(*kind),
            _ => None,
        }
    }

    /// Returns `true` if the call can continue, or the user can retry locally.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TrackReplaceFailed { .. } | Self::DeviceBusy { .. } | Self::InvalidInput(_)
        )
    }

    /// Returns `true` if this error ends the call attempt.
    #[must_use]
    pub const fn is_call_fatal(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. }
                | Self::DeviceNotFound { .. }
                | Self::ConnectFailed { .. }
                | Self::Timeout { .. }
                | Self::InvalidState { .. }
        )
    }

    /// Returns `true` if this error indicates a sequencing bug.
    #[must_use]
    pub const fn is_defect(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_display() {
        let err = CallError::PermissionDenied {
            kind: MediaKind::Video,
        };
        let msg = err.to_string();
        assert!(msg.contains("Permission to capture video was denied"));
        assert!(msg.contains("Suggestion"));
    }

    #[test]
    fn test_not_connected_display_names_state() {
        let err = CallError::NotConnected {
            state: CallState::Negotiating,
        };
        assert_eq!(
            err.to_string(),
            "Call is not connected (current state: negotiating)"
        );
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            CallError::connect_failed("ws://x", "refused").kind(),
            ErrorKind::ConnectFailed
        );
        assert_eq!(CallError::timeout("answer", 20).kind(), ErrorKind::Timeout);
        assert_eq!(
            CallError::InvalidInput("empty".into()).kind(),
            ErrorKind::Other
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(CallError::track_replace_failed("rejected").is_recoverable());
        assert!(CallError::DeviceBusy {
            kind: MediaKind::Audio
        }
        .is_recoverable());
        assert!(!CallError::PermissionDenied {
            kind: MediaKind::Audio
        }
        .is_recoverable());
    }

    #[test]
    fn test_is_call_fatal() {
        assert!(CallError::PermissionDenied {
            kind: MediaKind::Video
        }
        .is_call_fatal());
        assert!(CallError::connect_failed("ws://x", "refused").is_call_fatal());
        assert!(CallError::invalid_state("answer twice").is_call_fatal());
        assert!(!CallError::track_replace_failed("rejected").is_call_fatal());
        assert!(!CallError::NotConnected {
            state: CallState::Idle
        }
        .is_call_fatal());
    }

    #[test]
    fn test_is_defect() {
        assert!(CallError::invalid_state("x").is_defect());
        assert!(!CallError::timeout("x", 1).is_defect());
    }

    #[test]
    fn test_media_kind() {
        let err = CallError::DeviceNotFound {
            kind: MediaKind::Video,
        };
        assert_eq!(err.media_kind(), Some(MediaKind::Video));
        assert_eq!(CallError::timeout("x", 1).media_kind(), None);
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CallError = io_err.into();
        assert!(matches!(err, CallError::Io(_)));
    }
}
