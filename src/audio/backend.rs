use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::file::AudioFile;
use crate::error::AudioError;

/// Audio stream source type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioStreamSource {
    /// Agent speech received from the transport
    Remote,
    /// Local microphone
    Local,
}

/// Audio sample data (f32 in [-1, 1], interleaved)
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since the stream started
    pub timestamp_ms: u64,
    pub source: AudioStreamSource,
}

impl AudioFrame {
    /// Decode 16-bit little-endian PCM. A trailing odd byte is ignored.
    pub fn from_pcm16_le(
        bytes: &[u8],
        sample_rate: u32,
        channels: u16,
        timestamp_ms: u64,
        source: AudioStreamSource,
    ) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect();

        Self {
            samples,
            sample_rate,
            channels,
            timestamp_ms,
            source,
        }
    }

    /// Samples per channel
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.frame_count() as u64 * 1000 / self.sample_rate as u64
    }
}

/// Local microphone acquisition.
///
/// Returns a channel receiver that will receive audio frames until the
/// source ends.
#[async_trait::async_trait]
pub trait MicrophoneSource: Send + Sync {
    async fn acquire(&self) -> Result<mpsc::Receiver<AudioFrame>, AudioError>;

    /// Source name for logging
    fn name(&self) -> &str;
}

/// Microphone whose permission was refused
pub struct DeniedMicrophone;

#[async_trait::async_trait]
impl MicrophoneSource for DeniedMicrophone {
    async fn acquire(&self) -> Result<mpsc::Receiver<AudioFrame>, AudioError> {
        Err(AudioError::PermissionDenied(
            "microphone access was not granted".to_string(),
        ))
    }

    fn name(&self) -> &str {
        "denied"
    }
}

/// Streams a WAV file as if it were the microphone (testing, demos)
pub struct FileMicrophone {
    path: PathBuf,
    frame_ms: u64,
    /// Pace frames at playback speed instead of as fast as possible
    realtime: bool,
}

impl FileMicrophone {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            frame_ms: 20,
            realtime: true,
        }
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

#[async_trait::async_trait]
impl MicrophoneSource for FileMicrophone {
    async fn acquire(&self) -> Result<mpsc::Receiver<AudioFrame>, AudioError> {
        let audio = AudioFile::open(&self.path)
            .map_err(|e| AudioError::Device(format!("{:#}", e)))?;

        let channels = audio.channels.max(1);
        let frames_per_chunk = (audio.sample_rate as u64 * self.frame_ms / 1000).max(1) as usize;
        let chunk_len = frames_per_chunk * channels as usize;
        let frame_ms = self.frame_ms;
        let realtime = self.realtime;

        let (tx, rx) = mpsc::channel(100);

        tokio::spawn(async move {
            let mut timestamp_ms = 0;
            for chunk in audio.samples.chunks(chunk_len) {
                let frame = AudioFrame {
                    samples: chunk.to_vec(),
                    sample_rate: audio.sample_rate,
                    channels,
                    timestamp_ms,
                    source: AudioStreamSource::Local,
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
                timestamp_ms += frame_ms;
                if realtime {
                    tokio::time::sleep(Duration::from_millis(frame_ms)).await;
                }
            }
            info!("File microphone reached end of {}", audio.path);
        });

        Ok(rx)
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Acquire the microphone, degrading to a silent (already finished) source
/// when access is refused or the device fails.
pub async fn acquire_or_silence(
    source: &dyn MicrophoneSource,
) -> (mpsc::Receiver<AudioFrame>, bool) {
    match source.acquire().await {
        Ok(rx) => (rx, false),
        Err(AudioError::PermissionDenied(reason)) => {
            warn!("Microphone permission denied ({}); recording remote audio only", reason);
            (silent_source(), true)
        }
        Err(e) => {
            warn!("Microphone {} unavailable ({}); recording remote audio only", source.name(), e);
            (silent_source(), true)
        }
    }
}

fn silent_source() -> mpsc::Receiver<AudioFrame> {
    let (_tx, rx) = mpsc::channel(1);
    rx
}
