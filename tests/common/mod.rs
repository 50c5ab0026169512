#![allow(dead_code)]

pub mod mock_asr;
pub mod mock_avatar;
pub mod mock_llm;

use avatalk::asr::Utterance;
use avatalk::avatar::{PlaybackSink, SessionManager};
use avatalk::config::Config;
use avatalk::processor::Processor;
use avatalk::scheduler::PlaybackScheduler;
use avatalk::wake_word::WakeWordGate;
use mock_avatar::MockAvatar;
use mock_llm::{Script, ScriptedSource};
use std::sync::Arc;

pub fn test_config() -> Config {
    Config {
        openai_api_key: "sk-test".to_string(),
        heygen_api_key: "hg-test".to_string(),
        wake_words: vec!["assistant".to_string()],
        session_backoff_ms: 2000,
        speaking_timeout_secs: 30,
        ..Config::default()
    }
}

pub fn heard(text: &str) -> Utterance {
    Utterance::new(text).expect("non-empty utterance")
}

/// Whitespace-insensitive view of a text
pub fn squash(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Avatar pipeline wired against mocks
pub struct TestContext {
    pub config: Config,
    pub avatar: Arc<MockAvatar>,
    pub source: Arc<ScriptedSource>,
    pub sink: Arc<PlaybackSink>,
    pub sessions: SessionManager,
}

impl TestContext {
    pub fn new(avatar: MockAvatar, scripts: Vec<Script>) -> Self {
        let config = test_config();
        let avatar = Arc::new(avatar);
        let source = Arc::new(ScriptedSource::new(scripts));
        let sink = Arc::new(PlaybackSink::new(avatar.clone()));
        let sessions = SessionManager::new(avatar.clone(), sink.clone(), source.clone(), &config);
        Self {
            config,
            avatar,
            source,
            sink,
            sessions,
        }
    }

    /// Context with an active avatar session
    pub async fn started(avatar: MockAvatar, scripts: Vec<Script>) -> Self {
        let ctx = Self::new(avatar, scripts);
        ctx.sessions
            .start_session()
            .await
            .expect("Failed to start mock session");
        ctx
    }

    pub fn scheduler(&self) -> PlaybackScheduler {
        PlaybackScheduler::from_config(self.sink.clone(), &self.config)
    }

    pub fn processor(&self) -> Processor {
        Processor::new(
            WakeWordGate::new(&self.config.wake_words),
            self.source.clone(),
            self.scheduler(),
            self.sink.speaking(),
            self.config.speaking_timeout(),
        )
    }
}
