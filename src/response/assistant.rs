//! Assistant-run response source
//!
//! Appends the command to a persistent thread, starts a run and polls it.
//! Assistant messages newer than the high-water mark are emitted as
//! fragments while the run progresses.

use super::citations::strip_citations;
use super::{channel, FragmentSender, ResponseSource, ResponseStream};
use crate::config::{Config, MIN_POLL_INTERVAL_MS};
use crate::error::{AvatalkError, AvatalkResult};
use crate::wake_word::Command;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMessage {
    pub id: String,
    pub role: Role,
    pub text: String,
    /// The backend has finished writing this message
    pub completed: bool,
}

/// Status of an assistant run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
    Failed(String),
    Expired,
    Cancelled,
    RequiresAction,
}

impl RunStatus {
    /// Map a wire status string; `reason` is the backend's `last_error` message
    pub fn from_wire(status: &str, reason: Option<String>) -> Self {
        match status {
            "queued" => RunStatus::Queued,
            "in_progress" | "cancelling" => RunStatus::InProgress,
            "completed" => RunStatus::Completed,
            "expired" => RunStatus::Expired,
            "cancelled" => RunStatus::Cancelled,
            "requires_action" => RunStatus::RequiresAction,
            "failed" => RunStatus::Failed(reason.unwrap_or_else(|| "unknown reason".to_string())),
            other => RunStatus::Failed(format!("unexpected run status '{other}'")),
        }
    }
}

/// Thread/run operations of an assistant service
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    async fn create_thread(&self) -> AvatalkResult<String>;

    async fn delete_thread(&self, thread_id: &str) -> AvatalkResult<()>;

    /// Returns the new message id
    async fn append_message(&self, thread_id: &str, role: Role, text: &str)
        -> AvatalkResult<String>;

    /// Returns the run id
    async fn create_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
        instructions: &str,
    ) -> AvatalkResult<String>;

    async fn get_run(&self, thread_id: &str, run_id: &str) -> AvatalkResult<RunStatus>;

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> AvatalkResult<()>;

    /// Id of the newest message in the thread
    async fn last_message_id(&self, thread_id: &str) -> AvatalkResult<Option<String>>;

    /// Messages created after `after` (or all), oldest first
    async fn list_messages(
        &self,
        thread_id: &str,
        after: Option<&str>,
    ) -> AvatalkResult<Vec<ThreadMessage>>;
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub assistant_id: String,
    pub instructions: String,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            assistant_id: config.assistant_id.clone(),
            instructions: config.assistant_instructions.clone(),
            poll_interval: config.poll_interval(),
            max_polls: config.poll_max_iterations,
        }
    }
}

pub struct AssistantRunSource {
    backend: Arc<dyn AssistantBackend>,
    settings: RunSettings,
    thread: Mutex<Option<String>>,
    flight: Arc<Mutex<()>>,
}

impl AssistantRunSource {
    pub fn new(backend: Arc<dyn AssistantBackend>, mut settings: RunSettings) -> Self {
        settings.poll_interval = settings
            .poll_interval
            .max(Duration::from_millis(MIN_POLL_INTERVAL_MS));
        settings.max_polls = settings.max_polls.max(1);
        Self {
            backend,
            settings,
            thread: Mutex::new(None),
            flight: Arc::new(Mutex::new(())),
        }
    }

    pub async fn thread_id(&self) -> Option<String> {
        self.thread.lock().await.clone()
    }

    async fn ensure_thread(&self) -> AvatalkResult<String> {
        let mut thread = self.thread.lock().await;
        if let Some(id) = thread.as_ref() {
            return Ok(id.clone());
        }
        let id = self.backend.create_thread().await?;
        info!("🧵 Assistant thread created: {}", id);
        *thread = Some(id.clone());
        Ok(id)
    }
}

#[async_trait]
impl ResponseSource for AssistantRunSource {
    async fn initialize(&self) -> AvatalkResult<()> {
        self.ensure_thread().await.map(|_| ())
    }

    async fn produce(&self, command: &Command) -> AvatalkResult<ResponseStream> {
        let thread_id = self.ensure_thread().await?;
        // Wait for the previous run on this thread to finish
        let guard = self.flight.clone().lock_owned().await;
        let (mut tx, stream) = channel();

        let backend = self.backend.clone();
        let settings = self.settings.clone();
        let text = command.as_str().to_string();
        tokio::spawn(async move {
            let _guard = guard;
            let result = run_to_completion(&*backend, &settings, &thread_id, &text, &mut tx).await;
            if let Err(e) = &result {
                warn!("❌ Assistant run failed: {}", e);
            }
            tx.finish(result).await;
        });

        Ok(stream)
    }

    async fn release(&self) {
        let Some(thread_id) = self.thread.lock().await.take() else {
            return;
        };
        match self.backend.delete_thread(&thread_id).await {
            Ok(()) => info!("🧵 Assistant thread {} deleted", thread_id),
            Err(e) => warn!("⚠️ Failed to delete assistant thread {}: {}", thread_id, e),
        }
    }

    fn name(&self) -> &str {
        "assistant"
    }
}

async fn run_to_completion(
    backend: &dyn AssistantBackend,
    settings: &RunSettings,
    thread_id: &str,
    text: &str,
    tx: &mut FragmentSender,
) -> AvatalkResult<()> {
    // Captured before our own message goes in
    let mut mark = backend.last_message_id(thread_id).await?;
    backend.append_message(thread_id, Role::User, text).await?;
    let run_id = backend
        .create_run(thread_id, &settings.assistant_id, &settings.instructions)
        .await?;
    debug!("🏃 Run {} started on thread {}", run_id, thread_id);
    let mut emitted_any = false;

    for poll in 1..=settings.max_polls {
        tokio::time::sleep(settings.poll_interval).await;

        let status = backend.get_run(thread_id, &run_id).await?;
        debug!("🏃 Run {} poll {}: {:?}", run_id, poll, status);

        let finished = match status {
            RunStatus::Queued | RunStatus::InProgress => false,
            RunStatus::Completed => true,
            RunStatus::Failed(reason) => {
                return Err(AvatalkError::RunFailed {
                    status: "failed".to_string(),
                    reason,
                })
            }
            RunStatus::Expired => {
                return Err(AvatalkError::RunFailed {
                    status: "expired".to_string(),
                    reason: "run expired before completing".to_string(),
                })
            }
            RunStatus::Cancelled => {
                return Err(AvatalkError::RunFailed {
                    status: "cancelled".to_string(),
                    reason: "run was cancelled".to_string(),
                })
            }
            RunStatus::RequiresAction => {
                cancel_quietly(backend, thread_id, &run_id).await;
                return Err(AvatalkError::RunFailed {
                    status: "requires_action".to_string(),
                    reason: "tool outputs are not supported".to_string(),
                });
            }
        };

        let emitted =
            emit_new_messages(backend, thread_id, &mut mark, &mut emitted_any, finished, tx).await?;
        if !emitted {
            debug!("Response consumer went away, abandoning run {}", run_id);
            if !finished {
                cancel_quietly(backend, thread_id, &run_id).await;
            }
            return Ok(());
        }
        if finished {
            return Ok(());
        }
    }

    cancel_quietly(backend, thread_id, &run_id).await;
    Err(AvatalkError::Timeout(format!(
        "assistant run {} still pending after {} polls",
        run_id, settings.max_polls
    )))
}

/// Emit assistant messages past `mark` and advance it.
///
/// A message still being written stops the scan until the next poll, unless
/// the run has finished. Messages after the first are separated by a space
/// so they never fuse into one phrase. Returns false once the consumer is gone.
async fn emit_new_messages(
    backend: &dyn AssistantBackend,
    thread_id: &str,
    mark: &mut Option<String>,
    emitted_any: &mut bool,
    run_finished: bool,
    tx: &mut FragmentSender,
) -> AvatalkResult<bool> {
    let messages = backend.list_messages(thread_id, mark.as_deref()).await?;
    for message in messages {
        if message.role == Role::Assistant {
            if !message.completed && !run_finished {
                break;
            }
            let text = strip_citations(&message.text);
            if !text.is_empty() {
                let text = if *emitted_any { format!(" {text}") } else { text };
                *emitted_any = true;
                if !tx.send(text).await {
                    return Ok(false);
                }
            }
        }
        *mark = Some(message.id);
    }
    Ok(true)
}

async fn cancel_quietly(backend: &dyn AssistantBackend, thread_id: &str, run_id: &str) {
    if let Err(e) = backend.cancel_run(thread_id, run_id).await {
        warn!("⚠️ Failed to cancel run {}: {}", run_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::StreamEvent;
    use futures::StreamExt;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Thread kept in memory; each poll pops the next scripted status and
    /// appends the assistant messages scripted for it
    #[derive(Default)]
    struct FakeBackend {
        messages: StdMutex<Vec<ThreadMessage>>,
        script: StdMutex<VecDeque<(RunStatus, Vec<&'static str>)>>,
        cancelled: StdMutex<Vec<String>>,
        deleted: StdMutex<Vec<String>>,
    }

    impl FakeBackend {
        fn with_history(history: &[(Role, &str)]) -> Self {
            let backend = Self::default();
            for (role, text) in history {
                backend.push(*role, text);
            }
            backend
        }

        fn script(self, steps: Vec<(RunStatus, Vec<&'static str>)>) -> Self {
            *self.script.lock().unwrap() = steps.into();
            self
        }

        fn push(&self, role: Role, text: &str) -> String {
            let mut messages = self.messages.lock().unwrap();
            let id = format!("msg_{}", messages.len());
            messages.push(ThreadMessage {
                id: id.clone(),
                role,
                text: text.to_string(),
                completed: true,
            });
            id
        }
    }

    #[async_trait]
    impl AssistantBackend for FakeBackend {
        async fn create_thread(&self) -> AvatalkResult<String> {
            Ok("thread_1".to_string())
        }

        async fn delete_thread(&self, thread_id: &str) -> AvatalkResult<()> {
            self.deleted.lock().unwrap().push(thread_id.to_string());
            Ok(())
        }

        async fn append_message(&self, _: &str, role: Role, text: &str) -> AvatalkResult<String> {
            Ok(self.push(role, text))
        }

        async fn create_run(&self, _: &str, _: &str, _: &str) -> AvatalkResult<String> {
            Ok("run_1".to_string())
        }

        async fn get_run(&self, _: &str, _: &str) -> AvatalkResult<RunStatus> {
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some((status, replies)) => {
                    for reply in replies {
                        self.push(Role::Assistant, reply);
                    }
                    Ok(status)
                }
                None => Ok(RunStatus::InProgress),
            }
        }

        async fn cancel_run(&self, _: &str, run_id: &str) -> AvatalkResult<()> {
            self.cancelled.lock().unwrap().push(run_id.to_string());
            Ok(())
        }

        async fn last_message_id(&self, _: &str) -> AvatalkResult<Option<String>> {
            Ok(self.messages.lock().unwrap().last().map(|m| m.id.clone()))
        }

        async fn list_messages(
            &self,
            _: &str,
            after: Option<&str>,
        ) -> AvatalkResult<Vec<ThreadMessage>> {
            let messages = self.messages.lock().unwrap();
            let start = match after {
                Some(id) => messages.iter().position(|m| m.id == id).map_or(0, |i| i + 1),
                None => 0,
            };
            Ok(messages[start..].to_vec())
        }
    }

    fn settings(max_polls: u32) -> RunSettings {
        RunSettings {
            assistant_id: "asst_1".to_string(),
            instructions: String::new(),
            poll_interval: Duration::from_millis(250),
            max_polls,
        }
    }

    async fn collect(stream: ResponseStream) -> (Vec<String>, Option<AvatalkError>) {
        let mut texts = Vec::new();
        let mut error = None;
        let events: Vec<StreamEvent> = stream.collect().await;
        for event in events {
            match event {
                StreamEvent::Fragment(f) => texts.push(f.text),
                StreamEvent::Completed => {}
                StreamEvent::Failed(e) => error = Some(e),
            }
        }
        (texts, error)
    }

    fn command(text: &str) -> Command {
        Command::new(text).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_only_new_assistant_messages() {
        let backend = FakeBackend::with_history(&[
            (Role::User, "old question"),
            (Role::Assistant, "old answer"),
        ])
        .script(vec![
            (RunStatus::Queued, vec![]),
            (RunStatus::InProgress, vec!["Первая часть 【4:0†source】."]),
            (RunStatus::Completed, vec!["Вторая часть."]),
        ]);
        let source = AssistantRunSource::new(Arc::new(backend), settings(10));

        let stream = source.produce(&command("часы работы")).await.unwrap();
        let (texts, error) = collect(stream).await;

        assert!(error.is_none());
        assert_eq!(texts, vec!["Первая часть.", " Вторая часть."]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_messages_stay_separate_phrases() {
        let backend = FakeBackend::default().script(vec![(
            RunStatus::Completed,
            vec!["Open from 9 to 18.", "Call us anytime."],
        )]);
        let source = AssistantRunSource::new(Arc::new(backend), settings(10));

        let (texts, error) = collect(source.produce(&command("hours")).await.unwrap()).await;
        assert!(error.is_none());

        let mut segmenter = crate::phrase::PhraseSegmenter::new(50, false);
        let mut phrases: Vec<String> = texts.iter().flat_map(|t| segmenter.push(t)).collect();
        phrases.extend(segmenter.finish());
        assert_eq!(phrases, vec!["Open from 9 to 18.", "Call us anytime."]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_run_carries_reason() {
        let backend = FakeBackend::default().script(vec![(
            RunStatus::Failed("rate_limit_exceeded".to_string()),
            vec![],
        )]);
        let source = AssistantRunSource::new(Arc::new(backend), settings(10));

        let (texts, error) = collect(source.produce(&command("hi")).await.unwrap()).await;
        assert!(texts.is_empty());
        match error {
            Some(AvatalkError::RunFailed { status, reason }) => {
                assert_eq!(status, "failed");
                assert_eq!(reason, "rate_limit_exceeded");
            }
            other => panic!("expected RunFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_and_cancelled_are_failures() {
        for status in [RunStatus::Expired, RunStatus::Cancelled] {
            let backend = FakeBackend::default().script(vec![(status, vec![])]);
            let source = AssistantRunSource::new(Arc::new(backend), settings(10));
            let (_, error) = collect(source.produce(&command("hi")).await.unwrap()).await;
            assert!(matches!(error, Some(AvatalkError::RunFailed { .. })));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_bound_times_out_and_cancels() {
        let backend = Arc::new(FakeBackend::default());
        let source = AssistantRunSource::new(backend.clone(), settings(3));

        let started = tokio::time::Instant::now();
        let (_, error) = collect(source.produce(&command("hi")).await.unwrap()).await;

        assert!(matches!(error, Some(AvatalkError::Timeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(750));
        assert_eq!(*backend.cancelled.lock().unwrap(), vec!["run_1".to_string()]);
    }

    #[tokio::test]
    async fn test_poll_interval_has_a_floor() {
        let mut fast = settings(1);
        fast.poll_interval = Duration::from_millis(10);
        let source = AssistantRunSource::new(Arc::new(FakeBackend::default()), fast);
        assert_eq!(source.settings.poll_interval, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_thread_lifecycle() {
        let backend = Arc::new(FakeBackend::default());
        let source = AssistantRunSource::new(backend.clone(), settings(1));

        source.initialize().await.unwrap();
        assert_eq!(source.thread_id().await.as_deref(), Some("thread_1"));

        source.release().await;
        source.release().await;
        assert_eq!(*backend.deleted.lock().unwrap(), vec!["thread_1".to_string()]);
        assert!(source.thread_id().await.is_none());
    }

    #[test]
    fn test_status_from_wire() {
        assert_eq!(RunStatus::from_wire("queued", None), RunStatus::Queued);
        assert_eq!(
            RunStatus::from_wire("failed", Some("server_error".into())),
            RunStatus::Failed("server_error".into())
        );
        assert!(matches!(
            RunStatus::from_wire("incomplete", None),
            RunStatus::Failed(_)
        ));
    }
}
