//! Command Processor
//!
//! Runs one command cycle per wake-word utterance: gate, response source,
//! playback. Capture is muted from wake-word detection until the avatar has
//! finished speaking, so the avatar never answers itself.

use crate::asr::Utterance;
use crate::avatar::SessionEvent;
use crate::error::{AvatalkError, AvatalkResult};
use crate::ledger::TranscriptLedger;
use crate::response::ResponseSource;
use crate::scheduler::{PlaybackReport, PlaybackScheduler};
use crate::wake_word::{Command, GateDecision, WakeWordGate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

/// Result of processing an utterance
#[derive(Debug)]
pub enum ProcessResult {
    /// The answer was spoken
    Spoken(PlaybackReport),
    /// No wake word, or nothing after it
    Ignored,
    /// A command was already in flight or the avatar was speaking
    Muted,
    Failed(AvatalkError),
}

pub struct Processor {
    gate: WakeWordGate,
    source: Arc<dyn ResponseSource>,
    scheduler: PlaybackScheduler,
    speaking: watch::Receiver<bool>,
    muted: watch::Sender<bool>,
    ledger: Option<TranscriptLedger>,
    speaking_timeout: Duration,
}

impl Processor {
    pub fn new(
        gate: WakeWordGate,
        source: Arc<dyn ResponseSource>,
        scheduler: PlaybackScheduler,
        speaking: watch::Receiver<bool>,
        speaking_timeout: Duration,
    ) -> Self {
        let (muted, _) = watch::channel(false);
        Self {
            gate,
            source,
            scheduler,
            speaking,
            muted,
            ledger: None,
            speaking_timeout,
        }
    }

    /// Record every utterance, wake word or not
    pub fn with_ledger(mut self, ledger: TranscriptLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Mute flag for the recognition adapter
    pub fn muted(&self) -> watch::Receiver<bool> {
        self.muted.subscribe()
    }

    pub fn is_muted(&self) -> bool {
        *self.muted.borrow()
    }

    pub async fn process(&self, utterance: &Utterance) -> ProcessResult {
        if let Some(ledger) = &self.ledger {
            ledger.append(utterance);
        }

        if *self.speaking.borrow() || self.is_muted() {
            debug!("🔇 Muted, ignoring '{}'", utterance.text);
            return ProcessResult::Muted;
        }

        let command = match self.gate.check(utterance) {
            GateDecision::Command(command) => command,
            GateDecision::Empty | GateDecision::NoWakeWord => return ProcessResult::Ignored,
        };

        let claimed = self.muted.send_if_modified(|muted| {
            if *muted {
                false
            } else {
                *muted = true;
                true
            }
        });
        if !claimed {
            return ProcessResult::Muted;
        }

        info!("🎯 Command: '{}'", command);
        let result = self.run_cycle(&command).await;
        self.wait_until_quiet().await;
        self.muted.send_replace(false);
        debug!("🎤 Listening again");

        match result {
            Ok(report) => ProcessResult::Spoken(report),
            Err(e) => {
                warn!("❌ Command '{}' failed: {}", command, e);
                ProcessResult::Failed(e)
            }
        }
    }

    async fn run_cycle(&self, command: &Command) -> AvatalkResult<PlaybackReport> {
        let stream = self.source.produce(command).await?;
        self.scheduler.play(stream).await
    }

    async fn wait_until_quiet(&self) {
        let mut speaking = self.speaking.clone();
        let quiet = tokio::time::timeout(self.speaking_timeout, speaking.wait_for(|s| !*s)).await;
        if quiet.is_err() {
            warn!(
                "⚠️ Avatar still speaking after {:?}, unmuting anyway",
                self.speaking_timeout
            );
        }
    }

    /// Process utterances until capture ends or the avatar session is lost
    pub async fn run(
        &self,
        mut utterances: mpsc::Receiver<Utterance>,
        mut events: broadcast::Receiver<SessionEvent>,
    ) -> AvatalkResult<()> {
        loop {
            tokio::select! {
                utterance = utterances.recv() => {
                    let Some(utterance) = utterance else {
                        info!("🎤 Recognition ended");
                        return Ok(());
                    };
                    match self.process(&utterance).await {
                        ProcessResult::Failed(e) if e.is_session_fatal() => return Err(e),
                        ProcessResult::Failed(e) => warn!("💬 {}", e.user_message()),
                        ProcessResult::Spoken(_) | ProcessResult::Ignored | ProcessResult::Muted => {}
                    }
                }
                event = events.recv() => match event {
                    Ok(SessionEvent::Disconnected) => return Err(AvatalkError::Disconnected),
                    Ok(SessionEvent::StreamError(e)) => warn!("⚠️ Avatar stream error: {}", e),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Processor skipped {} session events", n)
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(AvatalkError::Disconnected),
                },
            }
        }
    }
}
