use std::io::Cursor;
use tracing::{debug, info};

use super::backend::AudioFrame;
use crate::error::AudioError;

/// Chunk configuration
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Duration of each chunk in milliseconds
    pub timeslice_ms: u64,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            timeslice_ms: 1000,
            sample_rate: 48000,
            channels: 2,
        }
    }
}

/// One encoded timeslice of the mixed recording.
///
/// Each chunk is a complete float WAV container so it can be decoded on its
/// own.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    /// Chunk number (0-indexed)
    pub chunk_index: usize,
    pub bytes: Vec<u8>,
    /// Start time in milliseconds since recording started
    pub start_ms: u64,
    /// End time in milliseconds since recording started
    pub end_ms: u64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel
    pub frame_count: usize,
}

/// Cuts the mixed stream into fixed-duration encoded chunks
pub struct TimesliceEncoder {
    config: ChunkConfig,
    pending: Vec<f32>,
    chunk_index: usize,
    /// Frames encoded so far, for chunk timing
    encoded_frames: u64,
}

impl TimesliceEncoder {
    pub fn new(config: ChunkConfig) -> Self {
        info!(
            "Timeslice encoder initialized: {}ms chunks, {}Hz, {} channels",
            config.timeslice_ms, config.sample_rate, config.channels
        );

        Self {
            config,
            pending: Vec::new(),
            chunk_index: 0,
            encoded_frames: 0,
        }
    }

    fn frames_per_chunk(&self) -> usize {
        (self.config.sample_rate as u64 * self.config.timeslice_ms / 1000).max(1) as usize
    }

    fn pending_frames(&self) -> usize {
        self.pending.len() / self.config.channels.max(1) as usize
    }

    /// Append a mixed frame, returning a chunk once a timeslice is full
    pub fn push(&mut self, frame: &AudioFrame) -> Result<Option<EncodedChunk>, AudioError> {
        self.pending.extend_from_slice(&frame.samples);

        if self.pending_frames() >= self.frames_per_chunk() {
            let split = self.frames_per_chunk() * self.config.channels as usize;
            let rest = self.pending.split_off(split);
            let samples = std::mem::replace(&mut self.pending, rest);
            return self.encode(samples).map(Some);
        }

        Ok(None)
    }

    /// Encode whatever is pending as a short final chunk
    pub fn flush(&mut self) -> Result<Option<EncodedChunk>, AudioError> {
        if self.pending_frames() == 0 {
            self.pending.clear();
            return Ok(None);
        }

        let samples = std::mem::take(&mut self.pending);
        self.encode(samples).map(Some)
    }

    fn encode(&mut self, samples: Vec<f32>) -> Result<EncodedChunk, AudioError> {
        let spec = hound::WavSpec {
            channels: self.config.channels,
            sample_rate: self.config.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };

        let mut bytes = Vec::new();
        {
            let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec)?;
            for &sample in &samples {
                writer.write_sample(sample)?;
            }
            writer.finalize()?;
        }

        let frame_count = samples.len() / self.config.channels.max(1) as usize;
        let rate = self.config.sample_rate.max(1) as u64;
        let start_ms = self.encoded_frames * 1000 / rate;
        self.encoded_frames += frame_count as u64;
        let end_ms = self.encoded_frames * 1000 / rate;

        let chunk = EncodedChunk {
            chunk_index: self.chunk_index,
            bytes,
            start_ms,
            end_ms,
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            frame_count,
        };
        self.chunk_index += 1;

        debug!(
            "Chunk {} encoded: {:.1}s - {:.1}s ({} frames)",
            chunk.chunk_index,
            chunk.start_ms as f64 / 1000.0,
            chunk.end_ms as f64 / 1000.0,
            chunk.frame_count
        );

        Ok(chunk)
    }
}
