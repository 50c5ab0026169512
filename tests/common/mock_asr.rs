//! Mock Recognizer for Testing
//!
//! Replays transcripts pushed through a channel, so a test decides when
//! the "user" speaks.

use async_trait::async_trait;
use avatalk::asr::Recognizer;
use avatalk::error::AvatalkResult;
use tokio::sync::mpsc;

pub struct MockRecognizer {
    lines: mpsc::UnboundedReceiver<String>,
}

impl MockRecognizer {
    /// The recognizer plus the handle used to "say" things to it
    pub fn new() -> (Self, mpsc::UnboundedSender<String>) {
        let (tx, lines) = mpsc::unbounded_channel();
        (Self { lines }, tx)
    }
}

#[async_trait]
impl Recognizer for MockRecognizer {
    async fn open(&mut self) -> AvatalkResult<()> {
        Ok(())
    }

    async fn run(&mut self, results: mpsc::Sender<String>) -> AvatalkResult<()> {
        while let Some(line) = self.lines.recv().await {
            if results.send(line).await.is_err() {
                break;
            }
        }
        // Speaker gone; stay silent instead of ending the session
        std::future::pending().await
    }

    fn name(&self) -> &str {
        "mock"
    }
}
