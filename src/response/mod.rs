//! Response sources
//!
//! A response source turns a [`Command`] into a [`ResponseStream`]: an ordered
//! sequence of text fragments ending in exactly one terminal event.
//!
//! Two sources exist:
//! - [`CompletionSource`]: one completion request, delegating to the assistant
//!   run when the model asks for the retrieval tool
//! - [`AssistantRunSource`]: a polled run on a persistent assistant thread

pub mod assistant;
pub mod citations;
pub mod completion;

use crate::error::{AvatalkError, AvatalkResult};
use crate::wake_word::Command;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub use assistant::{
    AssistantBackend, AssistantRunSource, Role, RunSettings, RunStatus, ThreadMessage,
};
pub use completion::{
    Completion, CompletionBackend, CompletionRequest, CompletionSettings, CompletionSource,
    ToolSpec, RETRIEVAL_TOOL,
};

const STREAM_BUFFER: usize = 64;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one response stream
pub type StreamId = u64;

/// One chunk of response text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFragment {
    pub stream: StreamId,
    pub seq: u64,
    pub text: String,
    /// Spoken on its own, ahead of the answer ("let me check")
    pub interim: bool,
}

#[derive(Debug)]
pub enum StreamEvent {
    Fragment(ResponseFragment),
    Completed,
    Failed(AvatalkError),
}

/// Producer half of a response stream
#[derive(Debug)]
pub struct FragmentSender {
    stream: StreamId,
    seq: u64,
    tx: mpsc::Sender<StreamEvent>,
}

impl FragmentSender {
    pub fn stream_id(&self) -> StreamId {
        self.stream
    }

    /// Emit a content fragment. Returns false once the consumer is gone.
    pub async fn send(&mut self, text: impl Into<String>) -> bool {
        self.emit(text.into(), false).await
    }

    /// Emit a fragment to be spoken whole before the content
    pub async fn interim(&mut self, text: impl Into<String>) -> bool {
        self.emit(text.into(), true).await
    }

    async fn emit(&mut self, text: String, interim: bool) -> bool {
        if text.is_empty() {
            return !self.tx.is_closed();
        }
        let fragment = ResponseFragment {
            stream: self.stream,
            seq: self.seq,
            text,
            interim,
        };
        self.seq += 1;
        self.tx.send(StreamEvent::Fragment(fragment)).await.is_ok()
    }

    pub async fn complete(self) {
        let _ = self.tx.send(StreamEvent::Completed).await;
    }

    pub async fn fail(self, error: AvatalkError) {
        let _ = self.tx.send(StreamEvent::Failed(error)).await;
    }

    /// Send the terminal event matching `result`
    pub async fn finish(self, result: AvatalkResult<()>) {
        match result {
            Ok(()) => self.complete().await,
            Err(e) => self.fail(e).await,
        }
    }
}

/// Consumer half: yields fragments, then one terminal event, then ends.
///
/// A producer that goes away without a terminal event counts as a failure.
#[derive(Debug)]
pub struct ResponseStream {
    id: StreamId,
    rx: mpsc::Receiver<StreamEvent>,
    finished: bool,
}

impl ResponseStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// A stream that has already completed with the given fragments
    pub fn from_fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fragments: Vec<String> = fragments.into_iter().map(Into::into).collect();
        let (tx, rx) = mpsc::channel(fragments.len() + 1);
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        for (seq, text) in fragments.into_iter().enumerate() {
            let _ = tx.try_send(StreamEvent::Fragment(ResponseFragment {
                stream: id,
                seq: seq as u64,
                text,
                interim: false,
            }));
        }
        let _ = tx.try_send(StreamEvent::Completed);
        Self {
            id,
            rx,
            finished: false,
        }
    }
}

impl Stream for ResponseStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if !matches!(event, StreamEvent::Fragment(_)) {
                    self.finished = true;
                    self.rx.close();
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(Some(StreamEvent::Failed(AvatalkError::backend(
                    "response",
                    "stream closed before completing",
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create a connected producer/consumer pair with a fresh stream id
pub fn channel() -> (FragmentSender, ResponseStream) {
    let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    (
        FragmentSender { stream: id, seq: 0, tx },
        ResponseStream {
            id,
            rx,
            finished: false,
        },
    )
}

/// Trait for response backends
#[async_trait]
pub trait ResponseSource: Send + Sync {
    /// Prepare long-lived resources (conversation thread)
    async fn initialize(&self) -> AvatalkResult<()> {
        Ok(())
    }

    /// Start answering `command`.
    ///
    /// Production runs in the background; errors after this returns arrive
    /// as [`StreamEvent::Failed`].
    async fn produce(&self, command: &Command) -> AvatalkResult<ResponseStream>;

    /// Tear down long-lived resources. Failures are logged, not returned.
    async fn release(&self) {}

    fn name(&self) -> &str;
}
