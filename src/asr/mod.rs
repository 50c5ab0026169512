//! ASR (Automatic Speech Recognition) Module
//!
//! Provides multiple recognizer backends:
//! - Wyoming: microphone capture transcribed by a remote Wyoming ASR server
//! - Console: one utterance per line of standard input
//!
//! [`RecognitionAdapter`] wraps any backend into a restartable, mutable
//! producer of [`Utterance`] values.

pub mod console;
pub mod wyoming;

use crate::config::Config;
use crate::error::{AvatalkError, AvatalkResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use console::ConsoleRecognizer;
pub use wyoming::{WyomingClient, WyomingRecognizer};

/// Consecutive failed sessions before the adapter gives up
const MAX_CONSECUTIVE_FAILURES: usize = 3;
const UTTERANCE_QUEUE: usize = 32;

/// A finalized transcript: trimmed, lowercase
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub captured_at: Instant,
}

impl Utterance {
    /// Normalize a raw transcript; `None` if nothing is left
    pub fn new(raw: &str) -> Option<Self> {
        let text = raw.trim().to_lowercase();
        if text.is_empty() {
            None
        } else {
            Some(Self {
                text,
                captured_at: Instant::now(),
            })
        }
    }
}

/// Trait for recognition capabilities
#[async_trait]
pub trait Recognizer: Send {
    /// Verify the capability can be used (device present, server reachable)
    async fn open(&mut self) -> AvatalkResult<()>;

    /// Run one recognition session, sending each final transcript to `results`.
    ///
    /// Returns when the session ends on its own. The adapter may drop the
    /// future at any suspension point to stop recognition.
    async fn run(&mut self, results: mpsc::Sender<String>) -> AvatalkResult<()>;

    /// Get the engine name
    fn name(&self) -> &str;
}

/// Factory to create the configured recognizer
pub fn create_recognizer(config: &Config) -> Box<dyn Recognizer> {
    match config.recognizer.as_str() {
        "console" => Box::new(ConsoleRecognizer::stdin()),
        _ => Box::new(WyomingRecognizer::new(
            WyomingClient::new(&config.wyoming_host, config.wyoming_port, &config.language),
            config.input_device,
        )),
    }
}

/// Continuous recognition with debounced auto-restart
pub struct RecognitionAdapter {
    recognizer: Option<Box<dyn Recognizer>>,
    restart_delay: Duration,
    muted: watch::Receiver<bool>,
    stop_tx: Option<watch::Sender<bool>>,
    driver: Option<JoinHandle<Box<dyn Recognizer>>>,
}

impl RecognitionAdapter {
    /// `muted` is true while the avatar is speaking or a command is in flight
    pub fn new(
        recognizer: Box<dyn Recognizer>,
        restart_delay: Duration,
        muted: watch::Receiver<bool>,
    ) -> Self {
        Self {
            recognizer: Some(recognizer),
            restart_delay,
            muted,
            stop_tx: None,
            driver: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.driver.is_some()
    }

    /// Begin producing utterances.
    ///
    /// Fails with a configuration error when the capability is unavailable.
    pub async fn start(&mut self) -> AvatalkResult<mpsc::Receiver<Utterance>> {
        let mut recognizer = self.recognizer.take().ok_or_else(|| {
            AvatalkError::Recognition("recognition already started".to_string())
        })?;

        if let Err(e) = recognizer.open().await {
            let message = format!("{} recognizer unavailable: {}", recognizer.name(), e);
            self.recognizer = Some(recognizer);
            return Err(AvatalkError::Config(message));
        }

        let (tx, rx) = mpsc::channel(UTTERANCE_QUEUE);
        let (stop_tx, stop_rx) = watch::channel(false);

        info!("🎤 Recognition started ({})", recognizer.name());
        self.driver = Some(tokio::spawn(drive(
            recognizer,
            tx,
            stop_rx,
            self.muted.clone(),
            self.restart_delay,
        )));
        self.stop_tx = Some(stop_tx);
        Ok(rx)
    }

    /// Halt recognition and suppress auto-restart
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(driver) = self.driver.take() {
            match driver.await {
                Ok(recognizer) => self.recognizer = Some(recognizer),
                Err(e) => warn!("Recognition task ended abnormally: {}", e),
            }
            info!("🎤 Recognition stopped");
        }
    }
}

enum SessionEnd {
    Stopped,
    Ended(AvatalkResult<()>),
}

async fn drive(
    mut recognizer: Box<dyn Recognizer>,
    tx: mpsc::Sender<Utterance>,
    mut stop_rx: watch::Receiver<bool>,
    mut muted: watch::Receiver<bool>,
    restart_delay: Duration,
) -> Box<dyn Recognizer> {
    let mut failures = 0usize;

    loop {
        let (raw_tx, mut raw_rx) = mpsc::channel::<String>(UTTERANCE_QUEUE);
        let mut produced = false;

        let end = {
            let session = recognizer.run(raw_tx);
            tokio::pin!(session);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break SessionEnd::Stopped,
                    Some(raw) = raw_rx.recv() => {
                        produced = true;
                        if !forward(&tx, &muted, &raw).await {
                            break SessionEnd::Stopped;
                        }
                    }
                    result = &mut session => break SessionEnd::Ended(result),
                }
            }
        };

        let result = match end {
            SessionEnd::Stopped => break,
            SessionEnd::Ended(result) => result,
        };

        // Results delivered just before the session ended
        while let Ok(raw) = raw_rx.try_recv() {
            produced = true;
            if !forward(&tx, &muted, &raw).await {
                return recognizer;
            }
        }

        match result {
            Ok(()) => {
                failures = 0;
                debug!("🎤 Recognition session ended");
            }
            Err(e) => {
                failures = if produced { 1 } else { failures + 1 };
                warn!(
                    "⚠️ Recognition session failed ({}/{}): {}",
                    failures, MAX_CONSECUTIVE_FAILURES, e
                );
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    warn!("❌ Giving up on {} recognizer", recognizer.name());
                    break;
                }
            }
        }

        if !wait_for_restart(&mut stop_rx, &mut muted, restart_delay).await {
            break;
        }
        debug!("🎤 Restarting recognition");
    }

    recognizer
}

/// Forward a transcript unless capture is muted. Returns false once the consumer is gone.
async fn forward(tx: &mpsc::Sender<Utterance>, muted: &watch::Receiver<bool>, raw: &str) -> bool {
    let Some(utterance) = Utterance::new(raw) else {
        return true;
    };
    if *muted.borrow() {
        debug!("🔇 Ignoring '{}' while muted", utterance.text);
        return true;
    }
    debug!("🗣 Recognized: '{}'", utterance.text);
    tx.send(utterance).await.is_ok()
}

/// Hold off while muted, then debounce. Returns false if stop was requested.
async fn wait_for_restart(
    stop_rx: &mut watch::Receiver<bool>,
    muted: &mut watch::Receiver<bool>,
    restart_delay: Duration,
) -> bool {
    if *stop_rx.borrow() {
        return false;
    }

    while *muted.borrow() {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    return false;
                }
            }
            changed = muted.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    tokio::select! {
        _ = stop_rx.changed() => false,
        _ = tokio::time::sleep(restart_delay) => true,
    }
}
