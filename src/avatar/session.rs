//! Avatar session lifecycle
//!
//! `Idle -> Starting -> Active -> Stopping -> Idle`, with `Starting -> Idle`
//! on failure and `Active -> Idle` when the stream is lost. This is the only
//! place that attaches sessions to the playback sink.

use super::{AvatarBackend, AvatarSettings, PlaybackSink, SessionEvent, SessionInfo};
use crate::config::Config;
use crate::error::{AvatalkError, AvatalkResult};
use crate::response::ResponseSource;
use crate::retry::retry_if;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
}

pub struct SessionManager {
    backend: Arc<dyn AvatarBackend>,
    sink: Arc<PlaybackSink>,
    source: Arc<dyn ResponseSource>,
    settings: AvatarSettings,
    max_attempts: usize,
    backoff: Duration,
    state: Arc<watch::Sender<SessionState>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        backend: Arc<dyn AvatarBackend>,
        sink: Arc<PlaybackSink>,
        source: Arc<dyn ResponseSource>,
        config: &Config,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            backend,
            sink,
            source,
            settings: AvatarSettings::from_config(config),
            max_attempts: config.session_max_attempts.max(1),
            backoff: config.session_backoff(),
            state: Arc::new(state),
            watcher: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Open a fresh avatar session and attach it to the sink.
    ///
    /// Stale sessions under the same credential are stopped before every
    /// attempt. Concurrency-limit errors are retried with linear backoff;
    /// anything else aborts. On failure the manager is back to `Idle`.
    pub async fn start_session(&self) -> AvatalkResult<SessionInfo> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == SessionState::Idle {
                *state = SessionState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(AvatalkError::Session(format!(
                "cannot start a session while {:?}",
                self.state()
            )));
        }

        info!("🚀 Starting avatar session");
        match self.open().await {
            Ok(session) => {
                self.sink.attach(session.clone());
                self.spawn_watcher();
                self.state.send_replace(SessionState::Active);
                info!("✅ Avatar session {} active", session.session_id);
                Ok(session)
            }
            Err(e) => {
                self.state.send_replace(SessionState::Idle);
                error!("❌ Avatar session failed to start: {}", e);
                Err(e)
            }
        }
    }

    async fn open(&self) -> AvatalkResult<SessionInfo> {
        self.source.initialize().await?;

        let max_attempts = self.max_attempts;
        let result = retry_if(
            max_attempts,
            self.backoff,
            || self.attempt(),
            |e| matches!(e, AvatalkError::ConcurrencyLimit(_)),
        )
        .await;

        match result {
            Err(AvatalkError::ConcurrencyLimit(message)) => Err(AvatalkError::Session(format!(
                "no free avatar slot after {max_attempts} attempts: {message}"
            ))),
            other => other,
        }
    }

    async fn attempt(&self) -> AvatalkResult<SessionInfo> {
        self.pre_terminate().await;
        let token = self.backend.create_token().await?;
        debug!("🎭 Creating avatar session");
        self.backend.create_session(&token, &self.settings).await
    }

    /// Best-effort stop of sessions left over from an earlier run
    async fn pre_terminate(&self) {
        if let Err(e) = self.terminate_stale().await {
            warn!("⚠️ Could not clean up stale avatar sessions: {}", e);
        }
    }

    async fn terminate_stale(&self) -> AvatalkResult<()> {
        debug!("🧹 Terminating stale avatar sessions");
        let token = self.backend.create_token().await?;
        match self.backend.terminate_all(&token).await {
            Ok(()) => Ok(()),
            Err(AvatalkError::Unauthorized(_)) => {
                debug!("No active avatar sessions found");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the active session. Does nothing unless `Active`.
    pub async fn end_session(&self) {
        let claimed = self.state.send_if_modified(|state| {
            if *state == SessionState::Active {
                *state = SessionState::Stopping;
                true
            } else {
                false
            }
        });
        if !claimed {
            debug!("No active avatar session to end");
            return;
        }

        info!("🛑 Ending avatar session");
        if let Some(watcher) = self.lock_watcher().take() {
            watcher.abort();
        }
        if let Some(session) = self.sink.detach() {
            if let Err(e) = self.backend.stop_session(&session).await {
                warn!("⚠️ Failed to stop avatar session {}: {}", session.session_id, e);
            }
        }
        self.source.release().await;

        self.state.send_replace(SessionState::Idle);
        info!("✅ Avatar session ended");
    }

    /// Fall back to `Idle` when the stream drops on its own
    fn spawn_watcher(&self) {
        let mut events = self.sink.subscribe();
        let state = self.state.clone();
        let watcher = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Disconnected) => {
                        let reset = state.send_if_modified(|s| {
                            if *s == SessionState::Active {
                                *s = SessionState::Idle;
                                true
                            } else {
                                false
                            }
                        });
                        if reset {
                            warn!("📴 Avatar stream disconnected, session reset");
                        }
                        break;
                    }
                    Ok(SessionEvent::StreamError(e)) => warn!("⚠️ Avatar stream error: {}", e),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Session watcher skipped {} events", n)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.lock_watcher().replace(watcher) {
            previous.abort();
        }
    }

    fn lock_watcher(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
