//! Mock language model backends for testing
//!
//! - [`MockCompletion`]: scripted completion answers, records requests
//! - [`ScriptedSource`]: a response source replaying fixed fragments

use async_trait::async_trait;
use avatalk::error::{AvatalkError, AvatalkResult};
use avatalk::response::{
    channel, Completion, CompletionBackend, CompletionRequest, ResponseSource, ResponseStream,
};
use avatalk::wake_word::Command;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Completion backend answering from a queue
#[derive(Default)]
pub struct MockCompletion {
    pub answers: Mutex<VecDeque<AvatalkResult<Completion>>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl MockCompletion {
    pub fn new(answers: impl IntoIterator<Item = AvatalkResult<Completion>>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn get_requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionBackend for MockCompletion {
    async fn complete(&self, request: CompletionRequest) -> AvatalkResult<Completion> {
        self.requests.lock().unwrap().push(request);
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AvatalkError::backend("mock", "no scripted answer")))
    }
}

/// One scripted answer
#[derive(Debug, Clone)]
pub struct Script {
    pub fragments: Vec<&'static str>,
    /// Terminate with a failure instead of completing
    pub fail: bool,
}

impl Script {
    pub fn complete(fragments: Vec<&'static str>) -> Self {
        Self {
            fragments,
            fail: false,
        }
    }

    pub fn failing(fragments: Vec<&'static str>) -> Self {
        Self {
            fragments,
            fail: true,
        }
    }
}

/// Response source replaying scripts, one per command
pub struct ScriptedSource {
    scripts: Mutex<VecDeque<Script>>,
    pub commands: Mutex<Vec<String>>,
    /// Gap between fragments
    pub fragment_delay: Duration,
}

impl ScriptedSource {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            commands: Mutex::new(Vec::new()),
            fragment_delay: Duration::from_millis(10),
        }
    }

    pub fn get_commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponseSource for ScriptedSource {
    async fn produce(&self, command: &Command) -> AvatalkResult<ResponseStream> {
        self.commands.lock().unwrap().push(command.as_str().to_string());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::complete(vec!["ok."]));

        let (mut tx, stream) = channel();
        let delay = self.fragment_delay;
        tokio::spawn(async move {
            for fragment in script.fragments {
                tokio::time::sleep(delay).await;
                if !tx.send(fragment).await {
                    return;
                }
            }
            if script.fail {
                tx.fail(AvatalkError::backend("mock", "stream broke")).await;
            } else {
                tx.complete().await;
            }
        });
        Ok(stream)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
