//! Error types for the signaling relay.

use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Result alias for relay operations.
pub type Result<T> = std::result::Result<T, SignalError>;

/// Everything the relay can refuse or fail at.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    // ========================================================================
    // Admission Errors
    // ========================================================================
    /// The room already holds the maximum number of peers.
    #[error("Call '{call_id}' already has {max} participants")]
    RoomFull {
        /// The room.
        call_id: String,
        /// Configured room size.
        max: usize,
    },

    /// The `peer` query parameter is missing or blank.
    #[error("Missing 'peer' query parameter")]
    MissingPeer,

    /// The request did not ask for a WebSocket upgrade.
    #[error("This endpoint only accepts WebSocket upgrades")]
    UpgradeRequired,

    /// No room exists for the call.
    #[error("No active room for call '{0}'")]
    RoomNotFound(String),

    // ========================================================================
    // Frame Errors
    // ========================================================================
    /// A text frame is not a valid signaling message.
    #[error("Invalid signaling frame: {0}")]
    InvalidFrame(String),

    /// A text frame exceeds `maxMessageBytes`.
    #[error("Frame of {size} bytes exceeds the {max}-byte limit")]
    FrameTooLarge {
        /// Received size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// A frame names a different call than the room it was sent in.
    #[error("Frame addressed to call '{got}' was sent in room '{expected}'")]
    WrongCall {
        /// The room's call id.
        expected: String,
        /// The call id inside the frame.
        got: String,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON in the relay configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your relay.json with a JSON linter")]
    ConfigParse {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// A relay setting is out of range.
    #[error("Invalid relay configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion.
        suggestion: String,
    },

    /// Binding or serving failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SignalError {
    /// Creates a `ConfigValidation` error.
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::RoomFull { .. } => StatusCode::CONFLICT,
            Self::MissingPeer
            | Self::InvalidFrame(_)
            | Self::FrameTooLarge { .. }
            | Self::WrongCall { .. } => StatusCode::BAD_REQUEST,
            Self::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            Self::RoomNotFound(_) => StatusCode::NOT_FOUND,
            Self::ConfigParse { .. } | Self::ConfigValidation { .. } | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Body of every error the relay reports, over HTTP or as a text frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Description of the error.
    pub error: String,
}

impl From<&SignalError> for ErrorResponse {
    fn from(err: &SignalError) -> Self {
        Self {
            error: err.to_string(),
        }
    }
}

impl IntoResponse for SignalError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorResponse::from(&self))).into_response()
    }
}
