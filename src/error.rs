//! Avatalk Error Types
//!
//! One taxonomy for every component of the voice pipeline.

use thiserror::Error;

/// Central error type for Avatalk
#[derive(Error, Debug)]
pub enum AvatalkError {
    /// Missing or malformed credential, unsupported capability
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Speech recognition error: {0}")]
    Recognition(String),

    /// Non-success answer from a remote service
    #[error("{service} error: {message}")]
    Backend { service: String, message: String },

    #[error("Avatar concurrency limit reached: {0}")]
    ConcurrencyLimit(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Assistant run ended in `failed`, `expired` or `cancelled`
    #[error("Assistant run {status}: {reason}")]
    RunFailed { status: String, reason: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Avatar stream disconnected")]
    Disconnected,

    #[error("Playback error: {0}")]
    Playback(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Avatalk operations
pub type AvatalkResult<T> = Result<T, AvatalkError>;

impl AvatalkError {
    pub fn backend(service: impl Into<String>, message: impl Into<String>) -> Self {
        AvatalkError::Backend {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Errors worth retrying locally with bounded attempts
    pub fn is_transient(&self) -> bool {
        match self {
            AvatalkError::ConcurrencyLimit(_) | AvatalkError::Timeout(_) => true,
            AvatalkError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Errors after which the avatar session cannot be used any more
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            AvatalkError::Disconnected | AvatalkError::Session(_) | AvatalkError::Unauthorized(_)
        )
    }

    /// Human-readable message for the person talking to the avatar
    pub fn user_message(&self) -> String {
        match self {
            AvatalkError::Config(_) => {
                "Configuration error. Please check credentials and settings.".to_string()
            }
            AvatalkError::Recognition(_) => {
                "Speech recognition is unavailable. Check the microphone.".to_string()
            }
            AvatalkError::Backend { service, .. } => {
                format!("{service} did not answer. Please try again.")
            }
            AvatalkError::ConcurrencyLimit(_) => {
                "Too many avatar sessions are open. Please try again in a minute.".to_string()
            }
            AvatalkError::Unauthorized(_) => {
                "The service rejected the credentials.".to_string()
            }
            AvatalkError::RunFailed { .. } => {
                "The assistant could not produce an answer. Please ask again.".to_string()
            }
            AvatalkError::Timeout(_) => "The assistant took too long to answer.".to_string(),
            AvatalkError::Session(_) | AvatalkError::Disconnected => {
                "The avatar session was lost. Start a new session to continue.".to_string()
            }
            AvatalkError::Playback(_) => "The avatar could not speak the answer.".to_string(),
            AvatalkError::Io(_) | AvatalkError::Json(_) | AvatalkError::Other(_) => {
                "An internal error occurred.".to_string()
            }
            AvatalkError::Http(_) => "Network error. Please check the connection.".to_string(),
        }
    }
}
