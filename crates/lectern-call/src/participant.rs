//! Call identity and participant descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a video call, shared by both peers and the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Creates a call id from any string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the negotiation this session plays.
///
/// The caller creates the offer; the callee answers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    /// Initiated the call and sends the offer.
    Caller,
    /// Accepted the call and sends the answer.
    Callee,
}

impl fmt::Display for CallRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caller => write!(f, "caller"),
            Self::Callee => write!(f, "callee"),
        }
    }
}

/// A participant's role on the learning platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformRole {
    /// Enrolled learner.
    Student,
    /// Course mentor.
    Mentor,
    /// Back-office administrator.
    Admin,
}

/// Who is on one end of the call. Read-only once the session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    /// Signaling peer id.
    pub peer_id: String,
    /// Name shown in the call UI and chat.
    pub display_name: String,
    /// Platform role.
    pub role: PlatformRole,
    /// `true` for the participant running this session.
    pub is_local: bool,
}

impl ParticipantInfo {
    /// Describes the local participant.
    #[must_use]
    pub fn local(peer_id: impl Into<String>, display_name: impl Into<String>, role: PlatformRole) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
            role,
            is_local: true,
        }
    }

    /// Describes the remote participant.
    #[must_use]
    pub fn remote(peer_id: impl Into<String>, display_name: impl Into<String>, role: PlatformRole) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
            role,
            is_local: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_is_transparent() {
        let id = CallId::from("call-42");
        assert_eq!(serde_json::to_string(&id).unwrap_or_default(), "\"call-42\"");
        assert_eq!(id.to_string(), "call-42");
    }

    #[test]
    fn test_participant_serializes_camel_case() {
        let p = ParticipantInfo::remote("m-1", "Dr. Ada", PlatformRole::Mentor);
        let json = serde_json::to_value(&p).unwrap_or_default();
        assert_eq!(json["peerId"], "m-1");
        assert_eq!(json["displayName"], "Dr. Ada");
        assert_eq!(json["role"], "mentor");
        assert_eq!(json["isLocal"], false);
    }
}
