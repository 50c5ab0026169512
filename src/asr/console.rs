//! Console recognizer: every line of input is one final transcript

use super::Recognizer;
use crate::error::{AvatalkError, AvatalkResult};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;

pub struct ConsoleRecognizer<R> {
    lines: Lines<R>,
    closed: bool,
}

impl ConsoleRecognizer<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R: AsyncBufRead + Unpin + Send> ConsoleRecognizer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            closed: false,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> Recognizer for ConsoleRecognizer<R> {
    async fn open(&mut self) -> AvatalkResult<()> {
        if self.closed {
            return Err(AvatalkError::Recognition("console input closed".to_string()));
        }
        Ok(())
    }

    async fn run(&mut self, results: mpsc::Sender<String>) -> AvatalkResult<()> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if results.send(line).await.is_err() {
                return Ok(());
            }
        }
        self.closed = true;
        Err(AvatalkError::Recognition("console input closed".to_string()))
    }

    fn name(&self) -> &str {
        "console"
    }
}
