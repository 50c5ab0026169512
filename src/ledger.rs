//! Transcript ledger and knowledge-base refresh
//!
//! Every recognized utterance is recorded, wake word or not. A background
//! task periodically uploads the ledger to the assistant's vector store,
//! replacing the file it uploaded last time, and clears what it sent.

use crate::asr::Utterance;
use crate::error::AvatalkResult;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// File storage backing the assistant's retrieval tool
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Upload a text blob, returning its file id
    async fn upload_text(&self, filename: &str, text: &str) -> AvatalkResult<String>;

    async fn attach(&self, store_id: &str, file_id: &str) -> AvatalkResult<()>;

    async fn detach(&self, store_id: &str, file_id: &str) -> AvatalkResult<()>;

    async fn delete_file(&self, file_id: &str) -> AvatalkResult<()>;
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub text: String,
    pub heard_at: DateTime<Local>,
}

/// Append-only list of what was heard since the last flush
#[derive(Debug, Clone, Default)]
pub struct TranscriptLedger {
    entries: Arc<Mutex<Vec<LedgerEntry>>>,
}

impl TranscriptLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, utterance: &Utterance) {
        self.lock().push(LedgerEntry {
            text: utterance.text.clone(),
            heard_at: Local::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// One line per utterance; returns how many entries were rendered
    pub fn render(&self) -> (usize, String) {
        let entries = self.lock();
        let text = entries
            .iter()
            .map(|e| format!("[{}] {}", e.heard_at.format("%Y-%m-%d %H:%M:%S"), e.text))
            .collect::<Vec<_>>()
            .join("\n");
        (entries.len(), text)
    }

    /// Forget the first `count` entries; later appends survive
    pub fn drain(&self, count: usize) {
        let mut entries = self.lock();
        let count = count.min(entries.len());
        entries.drain(..count);
    }

    /// Listening stopped; nothing heard so far is kept
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LedgerEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct ContextRefresher {
    store: Arc<dyn KnowledgeStore>,
    ledger: TranscriptLedger,
    store_id: String,
    current_file: Option<String>,
}

impl ContextRefresher {
    pub fn new(store: Arc<dyn KnowledgeStore>, ledger: TranscriptLedger, store_id: &str) -> Self {
        Self {
            store,
            ledger,
            store_id: store_id.to_string(),
            current_file: None,
        }
    }

    pub fn current_file(&self) -> Option<&str> {
        self.current_file.as_deref()
    }

    /// Upload the ledger and swap it in for the previous upload.
    ///
    /// Returns false when there was nothing to send.
    pub async fn refresh(&mut self) -> AvatalkResult<bool> {
        let (count, text) = self.ledger.render();
        if count == 0 {
            debug!("Transcript ledger empty, skipping knowledge refresh");
            return Ok(false);
        }

        let filename = format!("transcript-{}.txt", Local::now().format("%Y%m%d-%H%M%S"));
        let file_id = self.store.upload_text(&filename, &text).await?;
        debug!("📄 Uploaded {} ({} utterances) as {}", filename, count, file_id);

        if let Some(old) = self.current_file.take() {
            if let Err(e) = self.store.detach(&self.store_id, &old).await {
                warn!("⚠️ Failed to detach old transcript {}: {}", old, e);
            }
            if let Err(e) = self.store.delete_file(&old).await {
                warn!("⚠️ Failed to delete old transcript {}: {}", old, e);
            }
        }

        if let Err(e) = self.store.attach(&self.store_id, &file_id).await {
            if let Err(cleanup) = self.store.delete_file(&file_id).await {
                warn!("⚠️ Failed to delete unattached transcript {}: {}", file_id, cleanup);
            }
            return Err(e);
        }

        self.current_file = Some(file_id);
        self.ledger.drain(count);
        info!("📚 Knowledge base refreshed with {} utterances", count);
        Ok(true)
    }

    /// Refresh every `period` until the handle is aborted
    pub fn spawn(mut self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh().await {
                    warn!("⚠️ Knowledge refresh failed: {}", e);
                }
            }
        })
    }
}
