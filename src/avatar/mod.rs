//! Talking avatar
//!
//! - [`PlaybackSink`]: serialized speak requests and session lifecycle events
//! - [`SessionManager`]: session creation with retry, teardown
//!
//! The remote renderer is reached through [`AvatarBackend`].

pub mod session;
pub mod sink;

use crate::config::Config;
use crate::error::AvatalkResult;
use async_trait::async_trait;
use std::time::Duration;

pub use session::{SessionManager, SessionState};
pub use sink::{PlaybackHandle, PlaybackSink};

/// A complete phrase handed to the avatar, spoken verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakRequest {
    pub text: String,
}

impl SpeakRequest {
    /// Trimmed phrase, `None` if it is empty
    pub fn new(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            None
        } else {
            Some(Self {
                text: text.to_string(),
            })
        }
    }
}

/// Where the rendered video can be picked up
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamDescriptor {
    pub url: String,
    pub access_token: String,
}

/// One live avatar connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    /// Bearer token the session was created with
    pub token: String,
    pub stream: StreamDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Ready(StreamDescriptor),
    Disconnected,
    SpeakingStarted,
    SpeakingEnded,
    StreamError(String),
}

/// Avatar look and voice
#[derive(Debug, Clone)]
pub struct AvatarSettings {
    pub quality: String,
    pub avatar_name: String,
    pub voice_id: String,
    pub voice_rate: f32,
    pub voice_emotion: String,
}

impl AvatarSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            quality: config.avatar_quality.clone(),
            avatar_name: config.avatar_name.clone(),
            voice_id: config.voice_id.clone(),
            voice_rate: config.voice_rate,
            voice_emotion: config.voice_emotion.clone(),
        }
    }
}

/// Remote avatar rendering service
#[async_trait]
pub trait AvatarBackend: Send + Sync {
    /// Exchange the API key for a short-lived bearer token
    async fn create_token(&self) -> AvatalkResult<String>;

    /// Fails with `ConcurrencyLimit` when too many sessions are open
    async fn create_session(
        &self,
        token: &str,
        settings: &AvatarSettings,
    ) -> AvatalkResult<SessionInfo>;

    /// Queue `request` on the avatar; returns how long it will speak.
    ///
    /// Fails with `Disconnected` when the session is gone.
    async fn speak(&self, session: &SessionInfo, request: &SpeakRequest)
        -> AvatalkResult<Duration>;

    async fn stop_session(&self, session: &SessionInfo) -> AvatalkResult<()>;

    /// Stop every session open under `token`'s credential.
    ///
    /// `Unauthorized` means there was nothing to stop.
    async fn terminate_all(&self, token: &str) -> AvatalkResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speak_request_is_trimmed_and_non_empty() {
        let request = SpeakRequest::new("  Привет!  ").unwrap();
        assert_eq!(request.text, "Привет!");
        assert!(SpeakRequest::new(" \n ").is_none());
    }

    #[test]
    fn test_settings_from_config() {
        let settings = AvatarSettings::from_config(&Config::default());
        assert_eq!(settings.quality, "high");
        assert_eq!(settings.voice_emotion, "excited");
        assert!((settings.voice_rate - 1.3).abs() < f32::EPSILON);
    }
}
