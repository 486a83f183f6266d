//! The network boundary an annotation session talks to.
//!
//! [`AnnotationApi`] is the only way a session reaches the backend. The blocking HTTP client
//! lives in [`crate::http`] behind the `http` feature; tests supply in-memory fakes.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::clip::{ClipMetadata, ClipRequest};
use crate::submission::AnnotationSubmission;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The server rejected the bearer token (HTTP 401).
    #[error("unauthorized")]
    Unauthorized,

    /// Any other non-success status. `message` is the server's `{error}` text when present.
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The request never produced a response (connect, timeout, TLS, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// A response arrived but could not be understood.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }

    /// The text a server sent back in its `{error}` body, if any.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ApiError::Status { message, .. } if !message.is_empty() => Some(message),
            _ => None,
        }
    }
}

/// A clip as delivered by the server.
#[derive(Debug, Clone)]
pub struct ClipPayload {
    pub metadata: ClipMetadata,
    pub audio: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum ClipFetch {
    Clip(ClipPayload),
    /// No clips remain for this selection.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Body of a successful `/login` or `/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(default)]
    pub message: String,
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
    pub token: String,
}

/// Body of a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// Backends disagree on whether user ids are numbers or strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Int(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Int(n) => n.to_string(),
    })
}

pub trait AnnotationApi {
    /// Request the next clip. `token` is sent as a bearer token when present.
    fn fetch_clip(&self, request: &ClipRequest, token: Option<&str>)
    -> Result<ClipFetch, ApiError>;

    /// Persist one submission.
    fn submit_annotation(
        &self,
        token: &str,
        submission: &AnnotationSubmission,
    ) -> Result<(), ApiError>;

    /// Check a token against the protected endpoint.
    ///
    /// `Ok(false)` means the server rejected it; errors mean no verdict was reached.
    fn verify_token(&self, token: &str) -> Result<bool, ApiError>;

    fn login(&self, credentials: &Credentials) -> Result<LoginResponse, ApiError>;

    fn register(&self, credentials: &Credentials) -> Result<LoginResponse, ApiError>;
}

impl<T: AnnotationApi + ?Sized> AnnotationApi for &T {
    fn fetch_clip(
        &self,
        request: &ClipRequest,
        token: Option<&str>,
    ) -> Result<ClipFetch, ApiError> {
        (**self).fetch_clip(request, token)
    }

    fn submit_annotation(
        &self,
        token: &str,
        submission: &AnnotationSubmission,
    ) -> Result<(), ApiError> {
        (**self).submit_annotation(token, submission)
    }

    fn verify_token(&self, token: &str) -> Result<bool, ApiError> {
        (**self).verify_token(token)
    }

    fn login(&self, credentials: &Credentials) -> Result<LoginResponse, ApiError> {
        (**self).login(credentials)
    }

    fn register(&self, credentials: &Credentials) -> Result<LoginResponse, ApiError> {
        (**self).register(credentials)
    }
}
