//! Avatar playback sink
//!
//! Speak requests go into a queue drained by one worker per attached session,
//! so the avatar says phrases one at a time in the order they were issued.
//! Lifecycle events are broadcast; the speaking flag is a watch channel the
//! capture side can wait on.

use super::{AvatarBackend, SessionEvent, SessionInfo, SpeakRequest};
use crate::error::{AvatalkError, AvatalkResult};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

struct Job {
    request: SpeakRequest,
    done: oneshot::Sender<AvatalkResult<()>>,
}

struct Attached {
    session: SessionInfo,
    jobs: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

/// Resolves when the avatar has finished saying one phrase
#[derive(Debug)]
pub struct PlaybackHandle {
    done: oneshot::Receiver<AvatalkResult<()>>,
}

impl PlaybackHandle {
    /// A playback dropped by the sink (session gone) reports `Disconnected`
    pub async fn wait(self) -> AvatalkResult<()> {
        self.done.await.unwrap_or(Err(AvatalkError::Disconnected))
    }
}

pub struct PlaybackSink {
    backend: Arc<dyn AvatarBackend>,
    attached: Mutex<Option<Attached>>,
    events: broadcast::Sender<SessionEvent>,
    speaking: Arc<watch::Sender<bool>>,
}

impl PlaybackSink {
    pub fn new(backend: Arc<dyn AvatarBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (speaking, _) = watch::channel(false);
        Self {
            backend,
            attached: Mutex::new(None),
            events,
            speaking: Arc::new(speaking),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// True while the avatar is saying something
    pub fn speaking(&self) -> watch::Receiver<bool> {
        self.speaking.subscribe()
    }

    pub fn is_attached(&self) -> bool {
        self.lock()
            .as_ref()
            .map(|a| !a.jobs.is_closed())
            .unwrap_or(false)
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.lock().as_ref().map(|a| a.session.clone())
    }

    /// Queue a phrase behind everything issued before it
    pub fn speak(&self, request: SpeakRequest) -> AvatalkResult<PlaybackHandle> {
        let guard = self.lock();
        let attached = guard.as_ref().ok_or(AvatalkError::Disconnected)?;
        let (done, rx) = oneshot::channel();
        attached
            .jobs
            .send(Job { request, done })
            .map_err(|_| AvatalkError::Disconnected)?;
        Ok(PlaybackHandle { done: rx })
    }

    /// Start playing into `session`. Called by the session manager.
    pub fn attach(&self, session: SessionInfo) {
        self.detach();

        let (jobs, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(play(
            self.backend.clone(),
            session.clone(),
            rx,
            self.events.clone(),
            self.speaking.clone(),
        ));

        info!("🎥 Avatar stream ready ({})", session.session_id);
        let _ = self.events.send(SessionEvent::Ready(session.stream.clone()));
        *self.lock() = Some(Attached {
            session,
            jobs,
            worker,
        });
    }

    /// Stop playback. Anything queued or playing fails with `Disconnected`.
    pub fn detach(&self) -> Option<SessionInfo> {
        let attached = self.lock().take()?;
        attached.worker.abort();
        self.speaking.send_replace(false);
        debug!("📴 Avatar stream detached ({})", attached.session.session_id);
        let _ = self.events.send(SessionEvent::Disconnected);
        Some(attached.session)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Attached>> {
        self.attached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PlaybackSink {
    fn drop(&mut self) {
        if let Some(attached) = self.lock().take() {
            attached.worker.abort();
        }
    }
}

async fn play(
    backend: Arc<dyn AvatarBackend>,
    session: SessionInfo,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    events: broadcast::Sender<SessionEvent>,
    speaking: Arc<watch::Sender<bool>>,
) {
    while let Some(job) = jobs.recv().await {
        speaking.send_replace(true);
        let _ = events.send(SessionEvent::SpeakingStarted);
        debug!("🗣️ Avatar says: '{}'", job.request.text);

        let result = match backend.speak(&session, &job.request).await {
            Ok(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
            Err(e) => Err(e),
        };

        speaking.send_replace(false);
        let _ = events.send(SessionEvent::SpeakingEnded);

        match result {
            Ok(()) => {
                let _ = job.done.send(Ok(()));
            }
            Err(e) if e.is_session_fatal() => {
                warn!("📴 Avatar stream lost: {}", e);
                let _ = job.done.send(Err(AvatalkError::Disconnected));
                jobs.close();
                while let Ok(pending) = jobs.try_recv() {
                    let _ = pending.done.send(Err(AvatalkError::Disconnected));
                }
                let _ = events.send(SessionEvent::Disconnected);
                return;
            }
            Err(e) => {
                warn!("⚠️ Avatar failed to speak: {}", e);
                let _ = events.send(SessionEvent::StreamError(e.to_string()));
                let _ = job.done.send(Err(AvatalkError::Playback(e.to_string())));
            }
        }
    }
}
