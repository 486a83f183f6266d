//! Blocking HTTP implementation of [`AnnotationApi`].

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use tracing::{debug, warn};

use crate::api::{
    AnnotationApi, ApiError, ClipFetch, ClipPayload, Credentials, ErrorBody, LoginResponse,
};
use crate::clip::{ClipMetadata, ClipRequest};
use crate::error::{Error, Result};
use crate::submission::AnnotationSubmission;

pub const DEFAULT_API_URL: &str = "http://localhost:3000";

/// Environment variable overriding [`DEFAULT_API_URL`].
pub const API_URL_ENV: &str = "CLIPMARK_API_URL";

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// Longest slice of a non-JSON error body we carry into an error message.
const MAX_ERROR_BODY: usize = 256;

pub struct HttpApi {
    client: Client,
    base_url: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("clipmark/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| Error::msg(format!("failed to build HTTP client: {err}")))?;

        Ok(Self::with_client(client, base_url))
    }

    /// Reuse an existing client (e.g. one with custom TLS roots).
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self { client, base_url }
    }

    /// Base URL from `CLIPMARK_API_URL`, falling back to [`DEFAULT_API_URL`].
    pub fn from_env() -> Result<Self> {
        let base = std::env::var(API_URL_ENV).unwrap_or_else(|_| DEFAULT_API_URL.to_owned());
        Self::new(base)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn send(&self, req: RequestBuilder) -> std::result::Result<Response, ApiError> {
        req.send()
            .map_err(|err| ApiError::Transport(err.to_string()))
    }
}

/// Map a non-success response into an [`ApiError`], keeping the server's `{error}` text.
fn error_for_status(resp: Response) -> std::result::Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized);
    }
    Err(status_error(resp))
}

/// Like [`error_for_status`], but a 401 keeps its body: on `/login` it means bad credentials,
/// not an expired session.
fn credential_response(resp: Response) -> std::result::Result<Response, ApiError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    Err(status_error(resp))
}

fn status_error(resp: Response) -> ApiError {
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    let message = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => parsed.error,
        Err(_) => body.chars().take(MAX_ERROR_BODY).collect(),
    };
    ApiError::Status {
        status: status.as_u16(),
        message,
    }
}

fn json_body<T: serde::de::DeserializeOwned>(resp: Response) -> std::result::Result<T, ApiError> {
    resp.json::<T>()
        .map_err(|err| ApiError::Malformed(err.to_string()))
}

impl AnnotationApi for HttpApi {
    fn fetch_clip(
        &self,
        request: &ClipRequest,
        token: Option<&str>,
    ) -> std::result::Result<ClipFetch, ApiError> {
        let url = Url::parse_with_params(&self.url(&request.path), &request.query)
            .map_err(|err| ApiError::Transport(format!("invalid clip URL: {err}")))?;
        debug!(%url, "requesting clip");

        let mut req = self.client.get(url);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let resp = self.send(req)?;

        // Only an empty success means exhaustion. A 404 is a misrouted request.
        if resp.status() == StatusCode::NO_CONTENT {
            debug!("no clips remain");
            return Ok(ClipFetch::Exhausted);
        }
        let resp = error_for_status(resp)?;

        let headers = resp.headers().clone();
        let metadata = ClipMetadata::from_headers(|name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        })?;

        let audio = resp
            .bytes()
            .map_err(|err| ApiError::Transport(err.to_string()))?
            .to_vec();
        if audio.is_empty() {
            warn!(clip_id = %metadata.id, "clip response has an empty body");
        }

        Ok(ClipFetch::Clip(ClipPayload { metadata, audio }))
    }

    fn submit_annotation(
        &self,
        token: &str,
        submission: &AnnotationSubmission,
    ) -> std::result::Result<(), ApiError> {
        let req = self
            .client
            .post(self.url("/annotation"))
            .bearer_auth(token)
            .json(submission);
        error_for_status(self.send(req)?)?;
        Ok(())
    }

    fn verify_token(&self, token: &str) -> std::result::Result<bool, ApiError> {
        let req = self.client.get(self.url("/protected")).bearer_auth(token);
        match error_for_status(self.send(req)?) {
            Ok(_) => Ok(true),
            Err(ApiError::Unauthorized | ApiError::Status { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn login(&self, credentials: &Credentials) -> std::result::Result<LoginResponse, ApiError> {
        let req = self.client.post(self.url("/login")).json(credentials);
        json_body(credential_response(self.send(req)?)?)
    }

    fn register(
        &self,
        credentials: &Credentials,
    ) -> std::result::Result<LoginResponse, ApiError> {
        let req = self.client.post(self.url("/register")).json(credentials);
        json_body(credential_response(self.send(req)?)?)
    }
}
