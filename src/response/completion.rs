//! Direct completion response source
//!
//! One completion request per command. When the model calls the retrieval
//! tool, the command is handed to the assistant run instead: a short filler
//! phrase goes out first as an interim fragment, then the assistant's
//! fragments are forwarded under this source's stream.

use super::{channel, FragmentSender, ResponseSource, ResponseStream, StreamEvent};
use crate::config::Config;
use crate::error::{AvatalkError, AvatalkResult};
use crate::wake_word::Command;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Name of the function the model calls to consult the knowledge base
pub const RETRIEVAL_TOOL: &str = "get_assistant_response";

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    pub fn retrieval() -> Self {
        Self {
            name: RETRIEVAL_TOOL.to_string(),
            description: "Look up information in the knowledge base of the assistant. \
                          Use it for questions about the company, its services, schedule and prices."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The question to look up"
                    }
                },
                "required": ["query"]
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub tools: Vec<ToolSpec>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// What the model answered
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Text(String),
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> AvatalkResult<Completion>;
}

#[derive(Debug, Clone)]
pub struct CompletionSettings {
    pub system_prompt: String,
    pub filler_prompt: String,
    pub default_filler: String,
    pub fallback_reply: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            system_prompt: config.system_prompt.clone(),
            filler_prompt: config.filler_prompt.clone(),
            default_filler: config.default_filler.clone(),
            fallback_reply: config.fallback_reply.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    fn request(&self, system: &str, user: &str, tools: Vec<ToolSpec>) -> CompletionRequest {
        CompletionRequest {
            system: system.to_string(),
            user: user.to_string(),
            tools,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

pub struct CompletionSource {
    backend: Arc<dyn CompletionBackend>,
    retrieval: Option<Arc<dyn ResponseSource>>,
    settings: CompletionSettings,
    flight: Arc<Mutex<()>>,
}

impl CompletionSource {
    /// `retrieval` enables the knowledge-base tool
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        retrieval: Option<Arc<dyn ResponseSource>>,
        settings: CompletionSettings,
    ) -> Self {
        Self {
            backend,
            retrieval,
            settings,
            flight: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl ResponseSource for CompletionSource {
    async fn initialize(&self) -> AvatalkResult<()> {
        match &self.retrieval {
            Some(retrieval) => retrieval.initialize().await,
            None => Ok(()),
        }
    }

    async fn produce(&self, command: &Command) -> AvatalkResult<ResponseStream> {
        let guard = self.flight.clone().lock_owned().await;
        let (mut tx, stream) = channel();

        let backend = self.backend.clone();
        let retrieval = self.retrieval.clone();
        let settings = self.settings.clone();
        let command = command.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let result =
                answer(&*backend, retrieval.as_deref(), &settings, &command, &mut tx).await;
            if let Err(e) = &result {
                warn!("❌ Completion failed: {}", e);
            }
            tx.finish(result).await;
        });

        Ok(stream)
    }

    async fn release(&self) {
        if let Some(retrieval) = &self.retrieval {
            retrieval.release().await;
        }
    }

    fn name(&self) -> &str {
        "completion"
    }
}

async fn answer(
    backend: &dyn CompletionBackend,
    retrieval: Option<&dyn ResponseSource>,
    settings: &CompletionSettings,
    command: &Command,
    tx: &mut FragmentSender,
) -> AvatalkResult<()> {
    let tools = if retrieval.is_some() {
        vec![ToolSpec::retrieval()]
    } else {
        Vec::new()
    };
    let request = settings.request(&settings.system_prompt, command.as_str(), tools);

    match backend.complete(request).await? {
        Completion::Text(text) => {
            let text = text.trim();
            if text.is_empty() {
                debug!("Empty completion, using fallback reply");
                tx.send(settings.fallback_reply.clone()).await;
            } else {
                tx.send(text).await;
            }
            Ok(())
        }
        Completion::ToolCall { name, arguments } if name == RETRIEVAL_TOOL => {
            let Some(retrieval) = retrieval else {
                return Err(AvatalkError::backend(
                    "completion",
                    "retrieval tool requested but no assistant is configured",
                ));
            };
            let query = arguments
                .get("query")
                .and_then(|q| q.as_str())
                .and_then(Command::new)
                .unwrap_or_else(|| command.clone());
            info!("🔎 Looking up '{}' in the knowledge base", query);

            // The run starts while the filler is generated and spoken
            let found = retrieval.produce(&query).await?;
            let filler = generate_filler(backend, settings, command).await;
            if !tx.interim(filler).await {
                return Ok(());
            }
            forward(found, tx).await
        }
        Completion::ToolCall { name, .. } => Err(AvatalkError::backend(
            "completion",
            format!("model called unknown tool '{name}'"),
        )),
    }
}

/// One "let me check" sentence, falling back to the configured default
async fn generate_filler(
    backend: &dyn CompletionBackend,
    settings: &CompletionSettings,
    command: &Command,
) -> String {
    let request = settings.request(&settings.filler_prompt, command.as_str(), Vec::new());
    match backend.complete(request).await {
        Ok(Completion::Text(text)) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => settings.default_filler.clone(),
        Err(e) => {
            warn!("⚠️ Filler generation failed, using default: {}", e);
            settings.default_filler.clone()
        }
    }
}

async fn forward(mut found: ResponseStream, tx: &mut FragmentSender) -> AvatalkResult<()> {
    while let Some(event) = found.next().await {
        match event {
            StreamEvent::Fragment(fragment) => {
                if !tx.send(fragment.text).await {
                    return Ok(());
                }
            }
            StreamEvent::Completed => return Ok(()),
            StreamEvent::Failed(e) => return Err(e),
        }
    }
    Ok(())
}
