//! Configuration for call sessions.
//!
//! Settings live in `lectern.json` (camelCase keys). Every field has a
//! default, so a missing file or a partial file is fine; a file that exists
//! but is not valid JSON is an error.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CallError, Result};
use crate::media::MediaConstraints;
use crate::peer::IceServer;

/// File name looked up by [`CallConfig::load`].
pub const CONFIG_FILE_NAME: &str = "lectern.json";

/// URL prefixes accepted for ICE servers.
const ICE_SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer::stun("stun:stun.l.google.com:19302")]
}

fn default_signaling_url() -> String {
    "ws://127.0.0.1:3030".to_string()
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8080/api".to_string()
}

const fn default_negotiation_timeout() -> u64 {
    20
}

const fn default_reconnect_window() -> u64 {
    15
}

const fn default_reconnect_initial_backoff() -> u64 {
    500
}

const fn default_reconnect_max_backoff() -> u64 {
    4000
}

const fn default_poll_interval() -> u64 {
    10
}

const fn default_chat_max_length() -> usize {
    2000
}

const fn default_true() -> bool {
    true
}

/// Main configuration for a call session and the directory client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallConfig {
    /// STUN/TURN servers handed to the peer connection.
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,

    /// Base URL of the signaling relay.
    #[serde(default = "default_signaling_url")]
    pub signaling_url: String,

    /// Base URL of the platform REST API.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Seconds allowed between signaling connect and an established connection.
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,

    /// Seconds a connected call may spend reconnecting before it ends.
    #[serde(default = "default_reconnect_window")]
    pub reconnect_window_secs: u64,

    /// First reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_initial_backoff")]
    pub reconnect_initial_backoff_ms: u64,

    /// Ceiling for the doubling reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_max_backoff")]
    pub reconnect_max_backoff_ms: u64,

    /// Seconds between call-list refreshes.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Media to capture when joining.
    #[serde(default)]
    pub media: MediaSettings,

    /// Longest accepted chat message, in characters.
    #[serde(default = "default_chat_max_length")]
    pub chat_max_length: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            signaling_url: default_signaling_url(),
            api_base_url: default_api_base_url(),
            negotiation_timeout_secs: default_negotiation_timeout(),
            reconnect_window_secs: default_reconnect_window(),
            reconnect_initial_backoff_ms: default_reconnect_initial_backoff(),
            reconnect_max_backoff_ms: default_reconnect_max_backoff(),
            poll_interval_secs: default_poll_interval(),
            media: MediaSettings::default(),
            chat_max_length: default_chat_max_length(),
        }
    }
}

/// Which devices to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSettings {
    /// Capture the camera.
    #[serde(default = "default_true")]
    pub video: bool,

    /// Capture the microphone.
    #[serde(default = "default_true")]
    pub audio: bool,

    /// Continue with the other kind when one device is missing.
    #[serde(default = "default_true")]
    pub allow_partial: bool,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            allow_partial: true,
        }
    }
}

impl MediaSettings {
    /// The capture constraints these settings request.
    #[must_use]
    pub const fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            video: self.video,
            audio: self.audio,
        }
    }
}

impl CallConfig {
    /// Loads `lectern.json` from the current working directory.
    ///
    /// Returns the default configuration when the file does not exist.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            CallError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads `lectern.json` from `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from `path`.
    ///
    /// # Errors
    ///
    /// `ConfigParse` if the file exists but cannot be read or parsed;
    /// `ConfigValidation` if a value is out of range.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(CallError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| CallError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every value for range and shape.
    pub fn validate(&self) -> Result<()> {
        if self.ice_servers.is_empty() {
            return Err(CallError::config_validation(
                "iceServers must list at least one server",
                "Add a STUN server such as stun:stun.l.google.com:19302 to your lectern.json",
            ));
        }

        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(CallError::config_validation(
                    "every iceServers entry needs at least one URL",
                    "Fill in the urls list or remove the entry from your lectern.json",
                ));
            }
            if let Some(url) = server
                .urls
                .iter()
                .find(|url| !ICE_SCHEMES.iter().any(|scheme| url.starts_with(scheme)))
            {
                return Err(CallError::config_validation(
                    format!("ICE server URL '{url}' has an unsupported scheme"),
                    "Use a stun:, stuns:, turn: or turns: URL",
                ));
            }
        }

        if !(self.signaling_url.starts_with("ws://") || self.signaling_url.starts_with("wss://")) {
            return Err(CallError::config_validation(
                format!("signalingUrl '{}' is not a WebSocket URL", self.signaling_url),
                "Use a ws:// or wss:// URL for signalingUrl",
            ));
        }

        if self.api_base_url.trim().is_empty() {
            return Err(CallError::config_validation(
                "apiBaseUrl must not be empty",
                "Set apiBaseUrl to the platform API root, e.g. https://lectern.example/api",
            ));
        }

        for (name, value) in [
            ("negotiationTimeoutSecs", self.negotiation_timeout_secs),
            ("reconnectWindowSecs", self.reconnect_window_secs),
            ("reconnectInitialBackoffMs", self.reconnect_initial_backoff_ms),
            ("pollIntervalSecs", self.poll_interval_secs),
        ] {
            if value == 0 {
                return Err(CallError::config_validation(
                    format!("{name} must be greater than 0"),
                    format!("Set {name} to at least 1 in your lectern.json"),
                ));
            }
        }

        if self.reconnect_initial_backoff_ms > self.reconnect_max_backoff_ms {
            return Err(CallError::config_validation(
                "reconnectInitialBackoffMs exceeds reconnectMaxBackoffMs",
                "Lower reconnectInitialBackoffMs or raise reconnectMaxBackoffMs",
            ));
        }

        if !self.media.video && !self.media.audio {
            return Err(CallError::config_validation(
                "media must enable video, audio or both",
                "Set media.audio or media.video to true in your lectern.json",
            ));
        }

        if self.chat_max_length == 0 {
            return Err(CallError::config_validation(
                "chatMaxLength must be greater than 0",
                "Set chatMaxLength to at least 1 in your lectern.json",
            ));
        }

        Ok(())
    }

    /// Negotiation bound as a [`Duration`].
    #[must_use]
    pub const fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    /// Reconnect window as a [`Duration`].
    #[must_use]
    pub const fn reconnect_window(&self) -> Duration {
        Duration::from_secs(self.reconnect_window_secs)
    }

    /// First reconnect delay.
    #[must_use]
    pub const fn reconnect_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_backoff_ms)
    }

    /// Reconnect delay ceiling.
    #[must_use]
    pub const fn reconnect_max_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_backoff_ms)
    }

    /// Poll period as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
