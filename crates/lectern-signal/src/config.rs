//! Relay configuration, read from `relay.json`.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SignalError};

/// File name looked up by [`RelayConfig::load_from_dir`].
pub const RELAY_CONFIG_FILE_NAME: &str = "relay.json";

fn default_bind_addr() -> String {
    "127.0.0.1:3030".to_string()
}

const fn default_max_peers() -> usize {
    2
}

const fn default_max_message_bytes() -> usize {
    64 * 1024
}

/// Longest accepted heartbeat period.
pub const MAX_HEARTBEAT_SECS: u64 = 3600;

const fn default_heartbeat_secs() -> u64 {
    30
}

const fn default_max_missed_pongs() -> u32 {
    3
}

const fn default_outbox_capacity() -> usize {
    128
}

/// Settings for the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Listen address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Peers admitted per call room.
    #[serde(default = "default_max_peers")]
    pub max_peers_per_room: usize,

    /// Largest accepted text frame.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Seconds between heartbeat pings.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Unanswered pings before a connection is dropped.
    #[serde(default = "default_max_missed_pongs")]
    pub max_missed_pongs: u32,

    /// Frames buffered per connection before new ones are dropped.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_peers_per_room: default_max_peers(),
            max_message_bytes: default_max_message_bytes(),
            heartbeat_secs: default_heartbeat_secs(),
            max_missed_pongs: default_max_missed_pongs(),
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

impl RelayConfig {
    /// Loads `relay.json` from `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(RELAY_CONFIG_FILE_NAME))
    }

    /// Loads the configuration at `path`, or the default when it is missing.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(SignalError::ConfigParse {
                    path: path.to_path_buf(),
                    message: format!("failed to read file: {e}"),
                })
            }
        };

        let config: Self =
            serde_json::from_str(&contents).map_err(|e| SignalError::ConfigParse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every value for range and shape.
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;

        if self.max_peers_per_room < 2 {
            return Err(SignalError::config_validation(
                "maxPeersPerRoom must be at least 2",
                "A call needs both participants; set maxPeersPerRoom to 2",
            ));
        }

        for (name, value) in [
            ("maxMessageBytes", self.max_message_bytes),
            ("outboxCapacity", self.outbox_capacity),
        ] {
            if value == 0 {
                return Err(SignalError::config_validation(
                    format!("{name} must be greater than 0"),
                    format!("Set {name} to a positive value in your relay.json"),
                ));
            }
        }

        if self.heartbeat_secs == 0 || self.max_missed_pongs == 0 {
            return Err(SignalError::config_validation(
                "heartbeatSecs and maxMissedPongs must be greater than 0",
                "The defaults are heartbeatSecs = 30 and maxMissedPongs = 3",
            ));
        }

        if self.heartbeat_secs > MAX_HEARTBEAT_SECS {
            return Err(SignalError::config_validation(
                format!("heartbeatSecs must be at most {MAX_HEARTBEAT_SECS}"),
                format!("Set heartbeatSecs to {MAX_HEARTBEAT_SECS} or less in your relay.json"),
            ));
        }

        Ok(())
    }

    /// Parsed listen address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind_addr.parse().map_err(|e| {
            SignalError::config_validation(
                format!("bindAddr '{}' is not a socket address: {e}", self.bind_addr),
                "Use host:port, e.g. 0.0.0.0:3030",
            )
        })
    }

    /// Heartbeat period as a [`Duration`], capped at [`MAX_HEARTBEAT_SECS`].
    #[must_use]
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.min(MAX_HEARTBEAT_SECS))
    }
}
