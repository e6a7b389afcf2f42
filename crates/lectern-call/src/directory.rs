//! Client for the platform's video-call REST endpoints.
//!
//! The backend owns scheduling and call records; this client only reads and
//! transitions them. Responses are accepted bare or wrapped in `{"data": ...}`.

use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::participant::CallId;

/// Backend status of a video call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Booked for later.
    Scheduled,
    /// Waiting for the callee to answer.
    Ringing,
    /// In progress.
    Active,
    /// Finished normally.
    Ended,
    /// Declined by the callee.
    Rejected,
    /// Never answered.
    Missed,
}

impl CallStatus {
    /// Returns `true` if the call can still be joined.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Scheduled | Self::Ringing | Self::Active)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Ringing => "ringing",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Rejected => "rejected",
            Self::Missed => "missed",
        };
        f.write_str(s)
    }
}

/// A call as the backend records it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoCallRecord {
    /// Call id, also the signaling room.
    pub id: CallId,
    /// Title shown in call lists.
    pub title: String,
    /// Display name of whoever created the call.
    pub host_name: String,
    /// Current status.
    pub status: CallStatus,
    /// Planned start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Actual start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Actual end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Participant display names.
    #[serde(default)]
    pub participants: Vec<String>,
}

/// Request body for [`CallDirectory::create_call`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVideoCall {
    /// Title.
    pub title: String,
    /// Users to invite.
    pub participant_ids: Vec<String>,
    /// Planned start; `None` rings immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Status transitions the client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    /// Answer a ringing call.
    Accept,
    /// Decline a ringing call.
    Reject,
    /// Enter an active or scheduled call.
    Join,
    /// Close the call for everyone.
    End,
}

impl CallAction {
    /// URL segment for the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Join => "join",
            Self::End => "end",
        }
    }
}

/// Which list endpoint to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallListing {
    /// Calls ringing for the current user.
    #[default]
    Incoming,
    /// Upcoming scheduled calls.
    Scheduled,
    /// Past calls.
    History,
}

impl CallListing {
    /// URL segment for the listing.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Scheduled => "scheduled",
            Self::History => "history",
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Self::Wrapped { data } | Self::Bare(data) => data,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// REST client for `/video-calls`.
#[derive(Debug, Clone)]
pub struct CallDirectory {
    base_url: Url,
    token: Option<String>,
    client: Client,
}

impl CallDirectory {
    /// Creates a client for the API rooted at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| CallError::InvalidInput(format!("invalid API URL '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(CallError::InvalidInput(format!(
                "API URL '{base_url}' cannot carry a path"
            )));
        }
        Ok(Self {
            base_url,
            token: None,
            client: Client::new(),
        })
    }

    /// Creates a client from `apiBaseUrl`.
    pub fn from_config(config: &CallConfig) -> Result<Self> {
        Self::new(&config.api_base_url)
    }

    /// Sends `Authorization: Bearer <token>` on every request.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Returns `true` if a bearer token is set.
    #[must_use]
    pub const fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("video-calls").extend(segments);
        }
        url
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| CallError::InvalidInput(format!("invalid API token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    async fn request<T, B>(&self, method: Method, url: Url, body: Option<&B>) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        debug!(method = %method, url = %url, "directory request");
        let mut request = self.client.request(method, url).headers(self.headers()?);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = check_status(request.send().await?).await?;
        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.into_inner())
    }

    /// Fetches one call.
    pub async fn get_call(&self, id: &CallId) -> Result<VideoCallRecord> {
        let url = self.endpoint(&[id.as_str()]);
        self.request::<_, ()>(Method::GET, url, None).await
    }

    /// Creates a call.
    pub async fn create_call(&self, call: &NewVideoCall) -> Result<VideoCallRecord> {
        if call.title.trim().is_empty() {
            return Err(CallError::InvalidInput("call title cannot be empty".to_string()));
        }
        let url = self.endpoint(&[]);
        self.request(Method::POST, url, Some(call)).await
    }

    /// Requests `action` on a call and returns the updated record.
    pub async fn perform(&self, id: &CallId, action: CallAction) -> Result<VideoCallRecord> {
        let url = self.endpoint(&[id.as_str(), action.as_str()]);
        self.request::<_, ()>(Method::POST, url, None).await
    }

    /// Answers a ringing call.
    pub async fn accept(&self, id: &CallId) -> Result<VideoCallRecord> {
        self.perform(id, CallAction::Accept).await
    }

    /// Declines a ringing call.
    pub async fn reject(&self, id: &CallId) -> Result<VideoCallRecord> {
        self.perform(id, CallAction::Reject).await
    }

    /// Marks the current user as joined.
    pub async fn join(&self, id: &CallId) -> Result<VideoCallRecord> {
        self.perform(id, CallAction::Join).await
    }

    /// Closes the call.
    pub async fn end(&self, id: &CallId) -> Result<VideoCallRecord> {
        self.perform(id, CallAction::End).await
    }

    /// Reads one of the call lists.
    pub async fn list(&self, listing: CallListing) -> Result<Vec<VideoCallRecord>> {
        let url = self.endpoint(&[listing.as_str()]);
        self.request::<_, ()>(Method::GET, url, None).await
    }

    /// Calls ringing for the current user.
    pub async fn incoming(&self) -> Result<Vec<VideoCallRecord>> {
        self.list(CallListing::Incoming).await
    }

    /// Upcoming scheduled calls.
    pub async fn scheduled(&self) -> Result<Vec<VideoCallRecord>> {
        self.list(CallListing::Scheduled).await
    }

    /// Past calls.
    pub async fn history(&self) -> Result<Vec<VideoCallRecord>> {
        self.list(CallListing::History).await
    }
}

/// Maps a non-2xx response to `CallError::Api`, preferring the JSON
/// `error`/`message` field over the raw body.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|body| body.error.or(body.message))
        .unwrap_or_else(|| {
            if text.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                text
            }
        });
    Err(CallError::api(status.as_u16(), message))
}
