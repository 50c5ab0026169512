//! Playback scheduler
//!
//! Drives one response stream into the avatar: fragments are segmented into
//! phrases, each phrase is issued to the sink as soon as it is complete, and
//! the sink's queue keeps spoken order equal to issue order. Only the last
//! playback handle is kept; the cycle is over once it resolves.

use crate::avatar::{PlaybackHandle, PlaybackSink, SpeakRequest};
use crate::config::Config;
use crate::error::AvatalkResult;
use crate::phrase::PhraseSegmenter;
use crate::response::{ResponseStream, StreamEvent};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a finished cycle put on the avatar
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackReport {
    pub phrases: Vec<String>,
}

impl PlaybackReport {
    pub fn spoke(&self) -> bool {
        !self.phrases.is_empty()
    }
}

pub struct PlaybackScheduler {
    sink: Arc<PlaybackSink>,
    max_phrase_chars: usize,
    clause_marks: bool,
}

impl PlaybackScheduler {
    pub fn new(sink: Arc<PlaybackSink>, max_phrase_chars: usize, clause_marks: bool) -> Self {
        Self {
            sink,
            max_phrase_chars,
            clause_marks,
        }
    }

    pub fn from_config(sink: Arc<PlaybackSink>, config: &Config) -> Self {
        Self::new(sink, config.max_phrase_chars, config.clause_marks)
    }

    /// Speak `stream` to the end.
    ///
    /// Returns once the last phrase has been spoken. On a failed stream the
    /// unterminated tail is dropped and the error returned after the phrases
    /// already issued have played.
    pub async fn play(&self, mut stream: ResponseStream) -> AvatalkResult<PlaybackReport> {
        let mut segmenter = PhraseSegmenter::new(self.max_phrase_chars, self.clause_marks);
        let mut pending: Option<PlaybackHandle> = None;
        let mut report = PlaybackReport::default();

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Fragment(fragment) if fragment.interim => {
                    if let Some(handle) = pending.take() {
                        handle.wait().await?;
                    }
                    if let Some(handle) = self.issue(&fragment.text, &mut report)? {
                        handle.wait().await?;
                    }
                }
                StreamEvent::Fragment(fragment) => {
                    for phrase in segmenter.push(&fragment.text) {
                        if let Some(handle) = self.issue(&phrase, &mut report)? {
                            pending = Some(handle);
                        }
                    }
                }
                StreamEvent::Completed => {
                    if let Some(rest) = segmenter.finish() {
                        if let Some(handle) = self.issue(&rest, &mut report)? {
                            pending = Some(handle);
                        }
                    }
                    break;
                }
                StreamEvent::Failed(e) => {
                    // Phrases already issued still play; stay in the cycle until they end
                    if let Some(handle) = pending.take() {
                        let _ = handle.wait().await;
                    }
                    let dropped = segmenter.discard();
                    if !dropped.trim().is_empty() {
                        debug!("Dropping unfinished phrase '{}'", dropped.trim());
                    }
                    warn!("❌ Response stream {} failed: {}", stream.id(), e);
                    return Err(e);
                }
            }
        }

        if let Some(handle) = pending {
            handle.wait().await?;
        }
        debug!(
            "🏁 Response stream {} spoken in {} phrases",
            stream.id(),
            report.phrases.len()
        );
        Ok(report)
    }

    fn issue(
        &self,
        text: &str,
        report: &mut PlaybackReport,
    ) -> AvatalkResult<Option<PlaybackHandle>> {
        let Some(request) = SpeakRequest::new(text) else {
            return Ok(None);
        };
        report.phrases.push(request.text.clone());
        self.sink.speak(request).map(Some)
    }
}
