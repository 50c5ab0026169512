//! Avatalk - Voice-driven talking avatar
//!
//! Listens for a wake word, asks a language model and has a streaming
//! avatar speak the answer.

use anyhow::{anyhow, Result};
use avatalk::asr::{create_recognizer, RecognitionAdapter};
use avatalk::avatar::{PlaybackSink, SessionManager};
use avatalk::config::Config;
use avatalk::core::{HeyGenClient, OpenAiClient};
use avatalk::ledger::{ContextRefresher, TranscriptLedger};
use avatalk::processor::Processor;
use avatalk::response::{
    AssistantRunSource, CompletionSettings, CompletionSource, ResponseSource, RunSettings,
};
use avatalk::scheduler::PlaybackScheduler;
use avatalk::wake_word::WakeWordGate;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to the JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Audio input device index
    #[arg(short, long)]
    device: Option<usize>,

    /// Read commands from standard input instead of the microphone
    #[arg(long)]
    console: bool,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.apply_env();
    if args.console {
        config.recognizer = "console".to_string();
    }
    if args.device.is_some() {
        config.input_device = args.device;
    }
    Ok(config)
}

fn build_source(config: &Config, openai: &Arc<OpenAiClient>) -> Result<Arc<dyn ResponseSource>> {
    let assistant: Option<Arc<dyn ResponseSource>> = if config.assistant_id.is_empty() {
        None
    } else {
        Some(Arc::new(AssistantRunSource::new(
            openai.clone(),
            RunSettings::from_config(config),
        )))
    };

    match config.response_mode.as_str() {
        "assistant" => {
            assistant.ok_or_else(|| anyhow!("response_mode 'assistant' needs OPENAI_ASSISTANT_ID"))
        }
        _ => {
            if assistant.is_none() {
                info!("💡 No assistant configured, knowledge-base lookups disabled");
            }
            Ok(Arc::new(CompletionSource::new(
                openai.clone(),
                assistant,
                CompletionSettings::from_config(config),
            )))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args)?;

    // Setup logging; RUST_LOG wins over the flag and the config
    let level = if args.verbose {
        "debug".to_string()
    } else {
        config.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("avatalk={level},warn")));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("🎭 Avatalk v{} starting...", env!("CARGO_PKG_VERSION"));
    if let Err(e) = config.validate() {
        error!("❌ {}", e);
        return Err(e.into());
    }

    let openai = Arc::new(OpenAiClient::new(&config));
    let heygen = Arc::new(HeyGenClient::new(&config));
    let source = build_source(&config, &openai)?;

    let sink = Arc::new(PlaybackSink::new(heygen.clone()));
    let sessions = SessionManager::new(heygen, sink.clone(), source.clone(), &config);

    let session = match sessions.start_session().await {
        Ok(session) => session,
        Err(e) => {
            error!("❌ {}", e.user_message());
            return Err(e.into());
        }
    };
    info!("🎥 Avatar stream: {}", session.stream.url);

    let gate = WakeWordGate::new(config.wake_words.clone());
    let wake_words = gate.triggers().join("', '");
    let ledger = TranscriptLedger::new();
    let processor = Processor::new(
        gate,
        source,
        PlaybackScheduler::from_config(sink.clone(), &config),
        sink.speaking(),
        config.speaking_timeout(),
    )
    .with_ledger(ledger.clone());

    let refresher = if config.vector_store_id.is_empty() {
        None
    } else {
        let refresher = ContextRefresher::new(openai.clone(), ledger.clone(), &config.vector_store_id);
        Some(refresher.spawn(config.context_refresh()))
    };

    let mut recognition = RecognitionAdapter::new(
        create_recognizer(&config),
        config.restart_delay(),
        processor.muted(),
    );
    let result = match recognition.start().await {
        Ok(utterances) => {
            info!("✅ Avatalk ready - say '{}' followed by a question", wake_words);
            tokio::select! {
                result = processor.run(utterances, sink.subscribe()) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("👋 Interrupted");
                    Ok(())
                }
            }
        }
        Err(e) => Err(e),
    };

    recognition.stop().await;
    if let Some(refresher) = refresher {
        refresher.abort();
    }
    ledger.clear();
    sessions.end_session().await;

    if let Err(e) = result {
        warn!("⚠️ {}", e.user_message());
        return Err(e.into());
    }
    info!("👋 Avatalk stopped");
    Ok(())
}
