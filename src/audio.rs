//! Microphone capture using cpal
//!
//! The input stream lives on its own thread for as long as the returned
//! [`CaptureHandle`] exists; dropping the handle releases the device.

use crate::error::{AvatalkError, AvatalkResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const SAMPLE_RATE: u32 = 16000;
const CHUNK_SIZE: usize = 1024;
const CHUNK_QUEUE: usize = 256;
/// Longest speech segment handed to the recognizer (15s)
pub const MAX_SEGMENT_SAMPLES: usize = SAMPLE_RATE as usize * 15;

/// Owns the capture thread; the microphone is held until this is dropped
pub struct CaptureHandle {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Stop capturing and release the input device
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            debug!("🎙️ Microphone released");
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start audio capture and return the handle plus a receiver for 16 kHz mono chunks.
///
/// Fails fast when no input device is available or the stream cannot be built.
pub fn start_capture(
    device_index: Option<usize>,
) -> AvatalkResult<(CaptureHandle, mpsc::Receiver<Vec<i16>>)> {
    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE);
    let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<String, String>>(1);
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    let thread = std::thread::spawn(move || {
        let stream = match build_stream(device_index, chunk_tx) {
            Ok((stream, name)) => {
                let _ = ready_tx.send(Ok(name));
                stream
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        // Park until stop is requested or the handle is dropped
        let _ = stop_rx.recv();
        drop(stream);
    });

    match ready_rx.recv() {
        Ok(Ok(name)) => {
            info!("🎙️ Audio capture started on '{}'", name);
            Ok((
                CaptureHandle {
                    stop_tx: Some(stop_tx),
                    thread: Some(thread),
                },
                chunk_rx,
            ))
        }
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(AvatalkError::Recognition(e))
        }
        Err(_) => Err(AvatalkError::Recognition(
            "audio capture thread exited before reporting".to_string(),
        )),
    }
}

fn build_stream(
    device_index: Option<usize>,
    chunk_tx: mpsc::Sender<Vec<i16>>,
) -> Result<(cpal::Stream, String), String> {
    let host = cpal::default_host();

    let device = match device_index {
        Some(idx) => host
            .input_devices()
            .map_err(|e| e.to_string())?
            .nth(idx)
            .ok_or_else(|| format!("input device {idx} out of range"))?,
        None => host
            .default_input_device()
            .ok_or_else(|| "no default input device".to_string())?,
    };
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Fixed(CHUNK_SIZE as u32),
    };

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                if chunk_tx.try_send(data.to_vec()).is_err() {
                    debug!("Audio chunk dropped, consumer is behind");
                }
            },
            |err| {
                warn!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| e.to_string())?;

    stream.play().map_err(|e| e.to_string())?;
    Ok((stream, name))
}

/// Calculate audio energy (RMS)
pub fn calculate_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum: i64 = samples.iter().map(|&s| (s as i64).pow(2)).sum();
    (sum as f32 / samples.len() as f32).sqrt()
}

/// Cuts a chunk stream into speech segments using an energy threshold
#[derive(Debug)]
pub struct EnergyGate {
    threshold: f32,
    min_speech_chunks: usize,
    max_silence_chunks: usize,
    max_segment_samples: usize,
    segment: Vec<i16>,
    speech_chunks: usize,
    silence_chunks: usize,
}

impl Default for EnergyGate {
    fn default() -> Self {
        // ~0.2s of speech, ~0.8s of trailing silence at 1024-sample chunks
        Self::new(500.0, 3, 12)
    }
}

impl EnergyGate {
    pub fn new(threshold: f32, min_speech_chunks: usize, max_silence_chunks: usize) -> Self {
        Self {
            threshold,
            min_speech_chunks,
            max_silence_chunks,
            max_segment_samples: MAX_SEGMENT_SAMPLES,
            segment: Vec::new(),
            speech_chunks: 0,
            silence_chunks: 0,
        }
    }

    /// Cap on segment length; a longer segment is closed even without trailing silence
    pub fn with_max_segment(mut self, samples: usize) -> Self {
        self.max_segment_samples = samples.max(1);
        self
    }

    /// Feed one chunk; returns a finished speech segment when trailing silence
    /// or the length cap closes it
    pub fn push(&mut self, chunk: &[i16]) -> Option<Vec<i16>> {
        let is_speech = calculate_energy(chunk) > self.threshold;

        if self.segment.is_empty() && !is_speech {
            return None;
        }

        self.segment.extend_from_slice(chunk);
        if is_speech {
            self.speech_chunks += 1;
            self.silence_chunks = 0;
        } else {
            self.silence_chunks += 1;
        }

        if self.segment.len() >= self.max_segment_samples {
            debug!("✂️ Speech segment hit the length cap, closing it");
            return self.close();
        }
        if is_speech || self.silence_chunks < self.max_silence_chunks {
            return None;
        }
        self.close()
    }

    fn close(&mut self) -> Option<Vec<i16>> {
        let segment = std::mem::take(&mut self.segment);
        let enough = self.speech_chunks >= self.min_speech_chunks;
        self.reset();
        enough.then_some(segment)
    }

    fn reset(&mut self) {
        self.segment.clear();
        self.speech_chunks = 0;
        self.silence_chunks = 0;
    }
}

/// Little-endian PCM16 bytes for the wire
pub fn to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_calculation() {
        let silence = vec![0i16; 100];
        assert_eq!(calculate_energy(&silence), 0.0);

        let loud = vec![1000i16; 100];
        assert!(calculate_energy(&loud) > 0.0);
    }

    #[test]
    fn test_gate_emits_segment_after_silence() {
        let mut gate = EnergyGate::new(100.0, 2, 2);
        let loud = vec![1000i16; 8];
        let quiet = vec![0i16; 8];

        assert!(gate.push(&quiet).is_none());
        assert!(gate.push(&loud).is_none());
        assert!(gate.push(&loud).is_none());
        assert!(gate.push(&quiet).is_none());
        let segment = gate.push(&quiet).expect("segment should close");
        assert_eq!(segment.len(), 32);
    }

    #[test]
    fn test_gate_drops_short_blips() {
        let mut gate = EnergyGate::new(100.0, 3, 1);
        assert!(gate.push(&[1000i16; 8]).is_none());
        assert!(gate.push(&[0i16; 8]).is_none());
        // gate is clean again after the discarded blip
        assert!(gate.push(&[0i16; 8]).is_none());
    }

    #[test]
    fn test_gate_closes_endless_speech_at_cap() {
        let mut gate = EnergyGate::new(100.0, 2, 4).with_max_segment(32);
        let loud = vec![1000i16; 8];

        for _ in 0..3 {
            assert!(gate.push(&loud).is_none());
        }
        let segment = gate.push(&loud).expect("cap should close the segment");
        assert_eq!(segment.len(), 32);

        // The next segment starts from scratch
        assert!(gate.push(&loud).is_none());
        assert_eq!(gate.push(&loud), None);
        assert_eq!(gate.segment.len(), 16);
    }

    #[test]
    fn test_default_gate_caps_at_fifteen_seconds() {
        let mut gate = EnergyGate::default();
        let loud = vec![1000i16; CHUNK_SIZE];
        let chunks = MAX_SEGMENT_SAMPLES.div_ceil(CHUNK_SIZE);

        let closed: Vec<usize> = (0..chunks * 2)
            .filter_map(|_| gate.push(&loud))
            .map(|segment| segment.len())
            .collect();
        assert_eq!(closed, vec![chunks * CHUNK_SIZE; 2]);
    }

    #[test]
    fn test_pcm_bytes_little_endian() {
        assert_eq!(to_pcm_bytes(&[1, -1]), vec![1, 0, 0xff, 0xff]);
    }
}
