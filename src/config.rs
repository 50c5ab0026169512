use crate::error::{AvatalkError, AvatalkResult};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lower bound for assistant run polling, keeps us under backend rate limits
pub const MIN_POLL_INTERVAL_MS: u64 = 100;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Speech
    pub wake_words: Vec<String>,
    pub language: String,
    pub recognizer: String,
    pub wyoming_host: String,
    pub wyoming_port: u16,
    pub restart_delay_ms: u64,
    pub input_device: Option<usize>,

    // Language model
    #[serde(skip_serializing)]
    pub openai_api_key: String,
    pub openai_url: String,
    pub completion_model: String,
    pub assistant_model: String,
    pub assistant_id: String,
    pub system_prompt: String,
    pub assistant_instructions: String,
    pub filler_prompt: String,
    pub default_filler: String,
    pub fallback_reply: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub response_mode: String,
    pub poll_interval_ms: u64,
    pub poll_max_iterations: u32,

    // Phrasing
    pub max_phrase_chars: usize,
    pub clause_marks: bool,

    // Avatar
    #[serde(skip_serializing)]
    pub heygen_api_key: String,
    pub heygen_url: String,
    pub avatar_quality: String,
    pub avatar_name: String,
    pub voice_id: String,
    pub voice_rate: f32,
    pub voice_emotion: String,
    pub session_max_attempts: usize,
    pub session_backoff_ms: u64,
    pub speaking_timeout_secs: u64,

    // Knowledge base
    pub vector_store_id: String,
    pub context_refresh_secs: u64,

    // Meta
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wake_words: vec!["assistant".to_string(), "ассистент".to_string()],
            language: "ru-RU".to_string(),
            recognizer: "wyoming".to_string(),
            wyoming_host: "localhost".to_string(),
            wyoming_port: 10300,
            restart_delay_ms: 100,
            input_device: None,

            openai_api_key: String::new(),
            openai_url: "https://api.openai.com/v1".to_string(),
            completion_model: "gpt-4o-mini".to_string(),
            assistant_model: "gpt-4o".to_string(),
            assistant_id: String::new(),
            system_prompt: "Ты дружелюбный ассистент. Отвечай кратко, без смайликов и спецсимволов, на языке запроса.".to_string(),
            assistant_instructions: "Отвечай кратко и по делу. Используй разговорный стиль.".to_string(),
            filler_prompt: "Generate one or two long sentences, in the language of the request and without emoji or special characters, to say while the user waits for the answer.".to_string(),
            default_filler: "Сейчас посмотрю".to_string(),
            fallback_reply: "Извини, я не смог сформулировать ответ".to_string(),
            temperature: 0.7,
            max_tokens: 150,
            response_mode: "completion".to_string(),
            poll_interval_ms: 250,
            poll_max_iterations: 240,

            max_phrase_chars: 50,
            clause_marks: false,

            heygen_api_key: String::new(),
            heygen_url: "https://api.heygen.com".to_string(),
            avatar_quality: "high".to_string(),
            avatar_name: "default".to_string(),
            voice_id: "bc69c9589d6747028dc5ec4aec2b43c3".to_string(),
            voice_rate: 1.3,
            voice_emotion: "excited".to_string(),
            session_max_attempts: 3,
            session_backoff_ms: 2000,
            speaking_timeout_secs: 120,

            vector_store_id: String::new(),
            context_refresh_secs: 180,

            log_level: "INFO".to_string(),
        }
    }
}

impl Config {
    /// Load config from the default location, or create default
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    /// Load config from a file, falling back to defaults if it is unusable.
    /// A missing file is created with the defaults so there is something to edit.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            match config.save_to(path) {
                Ok(()) => tracing::info!("📝 Wrote default config to {}", path.display()),
                Err(e) => tracing::warn!("⚠️ Could not write default config: {}", e),
            }
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!("⚠️ Config file corrupted or invalid, using defaults: {}", e);
                let backup_path = path.with_extension("json.corrupt");
                let _ = std::fs::rename(path, &backup_path);
                Ok(Self::default())
            }
        }
    }

    /// Save config to file. Credentials are never written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Layer credentials and identifiers from the process environment
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let targets: [(&str, &mut String); 4] = [
            ("OPENAI_API_KEY", &mut self.openai_api_key),
            ("OPENAI_ASSISTANT_ID", &mut self.assistant_id),
            ("OPENAI_VECTOR_STORE_ID", &mut self.vector_store_id),
            ("HEYGEN_API_KEY", &mut self.heygen_api_key),
        ];
        for (name, slot) in targets {
            if let Some(value) = lookup(name).filter(|v| !v.trim().is_empty()) {
                *slot = value.trim().to_string();
            }
        }
    }

    /// Check the configuration before any component starts
    pub fn validate(&self) -> AvatalkResult<()> {
        if self.openai_api_key.is_empty() {
            return Err(AvatalkError::Config("OPENAI_API_KEY is not set".to_string()));
        }
        if self.heygen_api_key.is_empty() {
            return Err(AvatalkError::Config("HEYGEN_API_KEY is not set".to_string()));
        }
        if self.wake_words.iter().all(|w| w.trim().is_empty()) {
            return Err(AvatalkError::Config("at least one wake word is required".to_string()));
        }
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(AvatalkError::Config(format!(
                "poll_interval_ms must be at least {MIN_POLL_INTERVAL_MS}"
            )));
        }
        if self.poll_max_iterations == 0 {
            return Err(AvatalkError::Config("poll_max_iterations must be positive".to_string()));
        }
        if self.session_max_attempts == 0 {
            return Err(AvatalkError::Config("session_max_attempts must be positive".to_string()));
        }
        match self.response_mode.as_str() {
            "completion" | "assistant" => {}
            other => {
                return Err(AvatalkError::Config(format!("unknown response_mode '{other}'")));
            }
        }
        match self.recognizer.as_str() {
            "wyoming" | "console" => {}
            other => return Err(AvatalkError::Config(format!("unknown recognizer '{other}'"))),
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn session_backoff(&self) -> Duration {
        Duration::from_millis(self.session_backoff_ms)
    }

    pub fn speaking_timeout(&self) -> Duration {
        Duration::from_secs(self.speaking_timeout_secs)
    }

    pub fn context_refresh(&self) -> Duration {
        Duration::from_secs(self.context_refresh_secs)
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("avatalk")
        .join("config.json")
}
