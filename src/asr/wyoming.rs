//! Wyoming Protocol Client
//!
//! Implements the Wyoming protocol for external ASR services.
//! Events are JSON header lines over TCP, optionally followed by a binary payload.
//!
//! Reference: https://github.com/rhasspy/wyoming

use super::Recognizer;
use crate::audio::{self, EnergyGate};
use crate::error::{AvatalkError, AvatalkResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const TRANSCRIPT_TIMEOUT: Duration = Duration::from_secs(30);
/// Recognition session length before the recognizer ends on its own
const SESSION_LIMIT: Duration = Duration::from_secs(60);

/// Wyoming event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WyomingEvent {
    /// Describe request (handshake)
    #[serde(rename = "describe")]
    Describe,

    /// Ask for a transcript of the following audio
    #[serde(rename = "transcribe")]
    Transcribe(TranscribeData),

    /// Start of audio stream
    #[serde(rename = "audio-start")]
    AudioStart(AudioFormat),

    /// Audio chunk; samples follow the header as payload
    #[serde(rename = "audio-chunk")]
    AudioChunk(AudioFormat),

    /// End of audio stream
    #[serde(rename = "audio-stop")]
    AudioStop,

    /// Transcript result
    #[serde(rename = "transcript")]
    Transcript(TranscriptData),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeData {
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFormat {
    pub rate: u32,
    pub width: u8,
    pub channels: u8,
}

/// Transcript result data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptData {
    pub text: String,
}

/// Serialize an event header, adding `payload_length` when a payload follows
fn encode_header(event: &WyomingEvent, payload_length: usize) -> AvatalkResult<String> {
    let mut value = serde_json::to_value(event)?;
    if payload_length > 0 {
        value["payload_length"] = serde_json::json!(payload_length);
    }
    Ok(format!("{value}\n"))
}

async fn write_event<W: AsyncWrite + Unpin>(
    writer: &mut W,
    event: &WyomingEvent,
    payload: &[u8],
) -> AvatalkResult<()> {
    writer
        .write_all(encode_header(event, payload.len())?.as_bytes())
        .await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    Ok(())
}

/// Pull the transcript text out of one header line, if it is a transcript event
fn parse_transcript(line: &str) -> Option<String> {
    let event: serde_json::Value = serde_json::from_str(line).ok()?;
    if event.get("type").and_then(|t| t.as_str()) != Some("transcript") {
        return None;
    }
    event
        .get("data")?
        .get("text")?
        .as_str()
        .map(|t| t.to_string())
}

/// Wyoming client for ASR services
#[derive(Debug, Clone)]
pub struct WyomingClient {
    host: String,
    port: u16,
    language: String,
    sample_rate: u32,
}

impl WyomingClient {
    /// Create a new Wyoming client. `language` is a tag such as `ru-RU`.
    pub fn new(host: &str, port: u16, language: &str) -> Self {
        let language = language
            .split(['-', '_'])
            .next()
            .unwrap_or(language)
            .to_lowercase();
        Self {
            host: host.to_string(),
            port,
            language,
            sample_rate: audio::SAMPLE_RATE,
        }
    }

    /// Check if the server is available
    pub async fn health_check(&self) -> bool {
        match TcpStream::connect((&*self.host, self.port)).await {
            Ok(_) => {
                debug!("Wyoming server available at {}:{}", self.host, self.port);
                true
            }
            Err(e) => {
                warn!("Wyoming server not available: {}", e);
                false
            }
        }
    }

    /// Send one PCM16 segment and wait for its transcript
    pub async fn transcribe(&self, pcm: &[u8]) -> AvatalkResult<String> {
        let stream = TcpStream::connect((&*self.host, self.port))
            .await
            .map_err(|e| AvatalkError::Recognition(format!("Wyoming connect failed: {e}")))?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let format = AudioFormat {
            rate: self.sample_rate,
            width: 2,
            channels: 1,
        };
        let transcribe = WyomingEvent::Transcribe(TranscribeData {
            language: self.language.clone(),
        });

        write_event(&mut writer, &transcribe, &[]).await?;
        write_event(&mut writer, &WyomingEvent::AudioStart(format.clone()), &[]).await?;
        write_event(&mut writer, &WyomingEvent::AudioChunk(format), pcm).await?;
        write_event(&mut writer, &WyomingEvent::AudioStop, &[]).await?;
        writer.flush().await?;

        debug!("Sent audio ({} bytes), waiting for transcript...", pcm.len());

        let transcript = tokio::time::timeout(TRANSCRIPT_TIMEOUT, async {
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok::<_, AvatalkError>(String::new());
                }
                if let Some(text) = parse_transcript(&line) {
                    return Ok(text);
                }
            }
        })
        .await
        .map_err(|_| AvatalkError::Timeout("waiting for Wyoming transcript".to_string()))??;

        info!("📝 Wyoming transcript: '{}'", transcript);
        Ok(transcript)
    }
}

/// Microphone capture segmented by energy, transcribed by a Wyoming server
pub struct WyomingRecognizer {
    client: WyomingClient,
    device: Option<usize>,
    session_limit: Duration,
}

impl WyomingRecognizer {
    pub fn new(client: WyomingClient, device: Option<usize>) -> Self {
        Self {
            client,
            device,
            session_limit: SESSION_LIMIT,
        }
    }
}

#[async_trait]
impl Recognizer for WyomingRecognizer {
    async fn open(&mut self) -> AvatalkResult<()> {
        if !self.client.health_check().await {
            return Err(AvatalkError::Recognition(format!(
                "no Wyoming server at {}:{}",
                self.client.host, self.client.port
            )));
        }
        // Probe the microphone once so a missing device fails at start
        let (capture, _chunks) = audio::start_capture(self.device)?;
        capture.stop();
        Ok(())
    }

    async fn run(&mut self, results: mpsc::Sender<String>) -> AvatalkResult<()> {
        let (capture, mut chunks) = audio::start_capture(self.device)?;
        let mut gate = EnergyGate::default();
        let deadline = tokio::time::sleep(self.session_limit);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                chunk = chunks.recv() => {
                    let Some(chunk) = chunk else {
                        return Err(AvatalkError::Recognition("audio capture stopped".to_string()));
                    };
                    let Some(segment) = gate.push(&chunk) else {
                        continue;
                    };
                    let text = self.client.transcribe(&audio::to_pcm_bytes(&segment)).await?;
                    if !text.trim().is_empty() && results.send(text).await.is_err() {
                        break;
                    }
                }
            }
        }

        capture.stop();
        Ok(())
    }

    fn name(&self) -> &str {
        "wyoming"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_chunk_header_carries_payload_length() {
        let event = WyomingEvent::AudioChunk(AudioFormat {
            rate: 16000,
            width: 2,
            channels: 1,
        });
        let header = encode_header(&event, 4).unwrap();
        let value: serde_json::Value = serde_json::from_str(header.trim()).unwrap();
        assert_eq!(value["type"], "audio-chunk");
        assert_eq!(value["data"]["rate"], 16000);
        assert_eq!(value["payload_length"], 4);
    }

    #[test]
    fn test_unit_event_has_no_payload_length() {
        let header = encode_header(&WyomingEvent::AudioStop, 0).unwrap();
        assert!(header.contains("audio-stop"));
        assert!(!header.contains("payload_length"));
    }

    #[test]
    fn test_parse_transcript() {
        assert_eq!(
            parse_transcript(r#"{"type":"transcript","data":{"text":"привет ассистент"}}"#),
            Some("привет ассистент".to_string())
        );
        assert_eq!(parse_transcript(r#"{"type":"info","data":{}}"#), None);
        assert_eq!(parse_transcript("garbage"), None);
    }

    #[test]
    fn test_language_tag_shortened() {
        let client = WyomingClient::new("localhost", 10300, "ru-RU");
        assert_eq!(client.language, "ru");
    }

    #[tokio::test]
    async fn test_transcribe_against_fake_server() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !String::from_utf8_lossy(&received).contains("audio-stop") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"{\"type\":\"transcript\",\"data\":{\"text\":\"hello assistant\"}}\n")
                .await
                .unwrap();
            received
        });

        let client = WyomingClient::new("127.0.0.1", port, "en-US");
        let text = client.transcribe(&[1, 0, 2, 0]).await.unwrap();
        assert_eq!(text, "hello assistant");

        let received = String::from_utf8_lossy(&server.await.unwrap()).to_string();
        assert!(received.contains("\"language\":\"en\""));
        assert!(received.contains("\"payload_length\":4"));
    }
}
