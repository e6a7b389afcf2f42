//! Lectern Signaling Relay
//!
//! A WebSocket relay that pairs the two participants of a video call and
//! forwards signaling frames between them. Each call gets a room keyed by
//! its call id; frames are checked and stamped with the sender's peer id
//! before they reach the other side.

pub mod config;
pub mod error;
pub mod relay;
pub mod rooms;

pub use config::{RelayConfig, RELAY_CONFIG_FILE_NAME};
pub use error::{ErrorResponse, Result, SignalError};
pub use relay::{create_router, serve, validate_frame, HealthResponse, RelayState, RoomResponse};
pub use rooms::{Membership, RoomRegistry};
