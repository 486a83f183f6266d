use std::error::Error as StdError;

use thiserror::Error;

use crate::waveform::WaveformState;

/// Clipmark's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Clipmark's crate-wide error type.
///
/// This is intentionally decoupled from `anyhow` so downstream libraries aren't forced to
/// adopt `anyhow` in their own public APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// The region set failed the active validity policy. Nothing was sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The identity is missing or the server rejected the token.
    ///
    /// Whenever this is produced by a server response, local credentials have already been
    /// cleared.
    #[error("authentication required: {0}")]
    Auth(String),

    /// A network-boundary call failed for a reason other than authentication.
    #[error("{stage} failed: {message}")]
    Network {
        stage: NetworkStage,
        message: String,
    },

    #[error("an advance is already in flight")]
    AdvanceInFlight,

    #[error("no clip is loaded")]
    NoClip,

    #[error("waveform is not ready (state: {0:?})")]
    NotReady(WaveformState),

    #[error("waveform surface must be destroyed before it is initialized again")]
    StaleSurface,

    #[error("audio source unavailable: {0}")]
    AudioUnavailable(String),

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

/// Which network-boundary call an [`Error::Network`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStage {
    Submit,
    FetchClip,
    VerifyToken,
    Login,
}

impl std::fmt::Display for NetworkStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NetworkStage::Submit => "annotation submit",
            NetworkStage::FetchClip => "clip fetch",
            NetworkStage::VerifyToken => "token check",
            NetworkStage::Login => "credential exchange",
        };
        f.write_str(name)
    }
}

/// Local, pre-network rejection of the current region set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("add at least one region")]
    EmptyRegionSet,

    #[error("provide a class or comment for every region")]
    MissingClassOrComment { invalid: usize },

    #[error("select a class for every region")]
    MissingClass { invalid: usize },
}

impl Error {
    pub(crate) fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub(crate) fn network(stage: NetworkStage, err: impl std::fmt::Display) -> Self {
        Self::Network {
            stage,
            message: err.to_string(),
        }
    }

    /// The message a frontend should show for this error.
    ///
    /// Network failures collapse into a generic sentence per stage; the detailed cause is
    /// logged where the failure happened.
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation(err) => capitalize(&err.to_string()),
            Error::Auth(_) => "Your session has expired. Please log in again.".to_owned(),
            Error::Network { stage, .. } => match stage {
                NetworkStage::Submit => "Failed to submit annotation.".to_owned(),
                NetworkStage::FetchClip => "Failed to load next audio clip.".to_owned(),
                NetworkStage::VerifyToken => "Could not verify your session.".to_owned(),
                NetworkStage::Login => "An error occurred during login.".to_owned(),
            },
            Error::AdvanceInFlight => "Please wait for the current clip to finish saving.".to_owned(),
            Error::NoClip => "No audio clip is loaded.".to_owned(),
            Error::NotReady(_) => "The waveform is still loading.".to_owned(),
            Error::AudioUnavailable(_) => "The audio clip could not be loaded.".to_owned(),
            other => other.to_string(),
        }
    }

    /// Whether this error means the user has to sign in again.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth(_))
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>() + ".",
        None => String::new(),
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Message(format!("{err:#}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_user_messages_are_sentences() {
        let err = Error::from(ValidationError::EmptyRegionSet);
        assert_eq!(err.user_message(), "Add at least one region.");

        let err = Error::from(ValidationError::MissingClassOrComment { invalid: 2 });
        assert_eq!(
            err.user_message(),
            "Provide a class or comment for every region."
        );
    }

    #[test]
    fn network_user_message_hides_transport_detail() {
        let err = Error::network(NetworkStage::FetchClip, "connection reset by peer");
        assert_eq!(err.user_message(), "Failed to load next audio clip.");
        assert!(err.to_string().contains("connection reset by peer"));
    }

    #[test]
    fn anyhow_errors_keep_their_context_chain() {
        let err: Error = anyhow::anyhow!("root cause").context("outer").into();
        assert_eq!(err.to_string(), "outer: root cause");
    }
}
