//! Mock Avatar Backend for Testing
//!
//! Records every call with the (paused) clock time it happened at.

use async_trait::async_trait;
use avatalk::avatar::{AvatarBackend, AvatarSettings, SessionInfo, SpeakRequest, StreamDescriptor};
use avatalk::error::{AvatalkError, AvatalkResult};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Token,
    TerminateAll,
    Create,
    Speak,
    Stop,
}

/// Mock avatar that records spoken phrases
pub struct MockAvatar {
    /// Everything the avatar said, in order
    pub spoken: Mutex<Vec<String>>,
    pub calls: Mutex<Vec<(Call, Instant)>>,
    /// Errors returned by successive `create_session` calls
    pub create_errors: Mutex<VecDeque<AvatalkError>>,
    /// Phrase containing this text fails with `Disconnected`
    pub disconnect_on: Mutex<Option<String>>,
    /// How long each phrase takes to say
    pub speak_duration: Duration,
    /// `terminate_all` reports 401, as when nothing is open
    pub nothing_to_terminate: bool,
}

impl MockAvatar {
    pub fn new() -> Self {
        Self {
            spoken: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            create_errors: Mutex::new(VecDeque::new()),
            disconnect_on: Mutex::new(None),
            speak_duration: Duration::from_millis(500),
            nothing_to_terminate: false,
        }
    }

    pub fn with_speak_duration(mut self, duration: Duration) -> Self {
        self.speak_duration = duration;
        self
    }

    pub fn fail_creates(&self, errors: impl IntoIterator<Item = AvatalkError>) {
        self.create_errors.lock().unwrap().extend(errors);
    }

    pub fn get_spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    /// Times at which `call` happened
    pub fn times(&self, call: Call) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == call)
            .map(|(_, at)| *at)
            .collect()
    }

    /// Calls in order, without times
    pub fn call_order(&self) -> Vec<Call> {
        self.calls.lock().unwrap().iter().map(|(c, _)| *c).collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push((call, Instant::now()));
    }
}

impl Default for MockAvatar {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AvatarBackend for MockAvatar {
    async fn create_token(&self) -> AvatalkResult<String> {
        self.record(Call::Token);
        Ok("mock-token".to_string())
    }

    async fn create_session(&self, token: &str, _: &AvatarSettings) -> AvatalkResult<SessionInfo> {
        self.record(Call::Create);
        if let Some(e) = self.create_errors.lock().unwrap().pop_front() {
            return Err(e);
        }
        Ok(SessionInfo {
            session_id: "mock-session".to_string(),
            token: token.to_string(),
            stream: StreamDescriptor {
                url: "wss://mock".to_string(),
                access_token: "lk".to_string(),
            },
        })
    }

    async fn speak(&self, _: &SessionInfo, request: &SpeakRequest) -> AvatalkResult<Duration> {
        self.record(Call::Speak);
        let disconnect = self
            .disconnect_on
            .lock()
            .unwrap()
            .as_ref()
            .map(|needle| request.text.contains(needle.as_str()))
            .unwrap_or(false);
        if disconnect {
            return Err(AvatalkError::Disconnected);
        }
        self.spoken.lock().unwrap().push(request.text.clone());
        Ok(self.speak_duration)
    }

    async fn stop_session(&self, _: &SessionInfo) -> AvatalkResult<()> {
        self.record(Call::Stop);
        Ok(())
    }

    async fn terminate_all(&self, _: &str) -> AvatalkResult<()> {
        self.record(Call::TerminateAll);
        if self.nothing_to_terminate {
            Err(AvatalkError::Unauthorized("no active session".to_string()))
        } else {
            Ok(())
        }
    }
}
