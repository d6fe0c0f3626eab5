// Audio mixer for combining remote agent speech and microphone streams
//
// Each source is converted to the output format and appended to its own
// sample queue, so frame sizes do not matter: a 1s agent delta is mixed under
// fifty 20ms microphone frames, not in front of them. Output covers the span
// every open source has audio for. A source that falls more than
// `max_buffered_ms` behind is treated as silent for the overflow.

use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

use super::backend::{AudioFrame, AudioStreamSource};

/// Configuration for audio mixer
#[derive(Debug, Clone)]
pub struct MixerConfig {
    /// Target sample rate for output
    pub sample_rate: u32,
    /// Number of channels in output
    pub channels: u16,
    /// How far one source may run ahead of a silent open source before the
    /// excess is mixed without it
    pub max_buffered_ms: u64,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            max_buffered_ms: 2000,
        }
    }
}

struct SourceQueue {
    /// Interleaved samples in the output format
    samples: VecDeque<f32>,
    open: bool,
}

/// Audio mixer that combines multiple audio streams
pub struct AudioMixer {
    config: MixerConfig,
    queues: HashMap<AudioStreamSource, SourceQueue>,
    /// Frames emitted so far, for output timestamps
    mixed_frames: u64,
}

impl AudioMixer {
    pub fn new(config: MixerConfig, sources: &[AudioStreamSource]) -> Self {
        info!(
            "Audio mixer initialized: {}Hz, {} channels, {} sources",
            config.sample_rate,
            config.channels,
            sources.len()
        );

        let queues = sources
            .iter()
            .map(|s| {
                let queue = SourceQueue {
                    samples: VecDeque::new(),
                    open: true,
                };
                (*s, queue)
            })
            .collect();

        Self {
            config,
            queues,
            mixed_frames: 0,
        }
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    fn channels(&self) -> usize {
        self.config.channels.max(1) as usize
    }

    fn max_buffered_frames(&self) -> usize {
        (self.config.sample_rate as u64 * self.config.max_buffered_ms / 1000) as usize
    }

    /// Frames queued for `source` and not yet mixed
    pub fn buffered_frames(&self, source: AudioStreamSource) -> usize {
        self.queues
            .get(&source)
            .map_or(0, |q| q.samples.len() / self.channels())
    }

    /// Queue a frame, converting it to the output format first
    pub fn push(&mut self, frame: AudioFrame) {
        let Some(frame) = self.conform(frame) else {
            return;
        };

        match self.queues.get_mut(&frame.source) {
            Some(queue) => {
                debug!(
                    "Queued {:?} frame: {}ms ({} samples)",
                    frame.source,
                    frame.timestamp_ms,
                    frame.samples.len()
                );
                queue.samples.extend(frame.samples);
            }
            None => debug!("Skipping frame from unregistered source {:?}", frame.source),
        }
    }

    /// The source will not deliver any more frames
    pub fn mark_closed(&mut self, source: AudioStreamSource) {
        if let Some(queue) = self.queues.get_mut(&source) {
            if queue.open {
                queue.open = false;
                info!("Audio source {:?} closed", source);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.queues.values().all(|q| !q.open && q.samples.is_empty())
    }

    /// Next mixed frame, if the queues allow one to be produced now
    pub fn next_ready(&mut self) -> Option<AudioFrame> {
        let channels = self.channels();
        let longest = self
            .queues
            .values()
            .map(|q| q.samples.len() / channels)
            .max()
            .unwrap_or(0);

        let covered = self
            .queues
            .values()
            .filter(|q| q.open)
            .map(|q| q.samples.len() / channels)
            .min()
            // Every source closed: whatever is left is final
            .unwrap_or(longest);
        let overflow = longest.saturating_sub(self.max_buffered_frames());

        let span = covered.max(overflow);
        if span == 0 {
            return None;
        }
        if covered < overflow {
            debug!("Mixing {} frames past the buffer bound without a lagging source", overflow);
        }
        Some(self.mix_span(span))
    }

    /// Mix out everything queued regardless of readiness
    pub fn drain(&mut self) -> Option<AudioFrame> {
        let channels = self.channels();
        let longest = self
            .queues
            .values()
            .map(|q| q.samples.len() / channels)
            .max()
            .unwrap_or(0);

        (longest > 0).then(|| self.mix_span(longest))
    }

    /// Mix `frames` frames from the front of every queue by adding samples
    ///
    /// A queue shorter than the span contributes silence for the rest
    fn mix_span(&mut self, frames: usize) -> AudioFrame {
        let len = frames * self.channels();
        let mut mixed_samples = vec![0.0f32; len];

        for queue in self.queues.values_mut() {
            let take = len.min(queue.samples.len());
            for (out, sample) in mixed_samples.iter_mut().zip(queue.samples.drain(..take)) {
                *out += sample;
            }
        }
        for sample in &mut mixed_samples {
            *sample = sample.clamp(-1.0, 1.0);
        }

        let timestamp_ms = self.mixed_frames * 1000 / self.config.sample_rate.max(1) as u64;
        self.mixed_frames += frames as u64;

        debug!("Mixed {} frames at {}ms", frames, timestamp_ms);

        AudioFrame {
            samples: mixed_samples,
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            timestamp_ms,
            // Mixed frames are marked as Remote
            source: AudioStreamSource::Remote,
        }
    }

    /// Convert channel layout and sample rate to the mixer's output format
    fn conform(&self, mut frame: AudioFrame) -> Option<AudioFrame> {
        if frame.channels == 0 || frame.sample_rate == 0 {
            warn!("Dropping {:?} frame with empty format", frame.source);
            return None;
        }

        if frame.channels != self.config.channels {
            frame.samples = match (frame.channels, self.config.channels) {
                (1, to) => upmix(&frame.samples, to as usize),
                (from, 1) => downmix(&frame.samples, from as usize),
                (from, to) => {
                    warn!(
                        "Frame channel count mismatch: expected {}, got {}. Dropping frame.",
                        to, from
                    );
                    return None;
                }
            };
            frame.channels = self.config.channels;
        }

        if frame.sample_rate != self.config.sample_rate {
            frame.samples = resample_linear(
                &frame.samples,
                frame.channels as usize,
                frame.sample_rate,
                self.config.sample_rate,
            );
            frame.sample_rate = self.config.sample_rate;
        }

        Some(frame)
    }
}

fn upmix(mono: &[f32], channels: usize) -> Vec<f32> {
    mono.iter()
        .flat_map(|&s| std::iter::repeat(s).take(channels))
        .collect()
}

fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear interpolation resampler over interleaved samples
fn resample_linear(samples: &[f32], channels: usize, from: u32, to: u32) -> Vec<f32> {
    let in_frames = samples.len() / channels;
    if in_frames == 0 {
        return Vec::new();
    }

    let out_frames = (in_frames as u64 * to as u64 / from as u64) as usize;
    let step = from as f64 / to as f64;
    let mut out = Vec::with_capacity(out_frames * channels);

    for i in 0..out_frames {
        let pos = i as f64 * step;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let next = (idx + 1).min(in_frames - 1);

        for ch in 0..channels {
            let a = samples[idx * channels + ch];
            let b = samples[next * channels + ch];
            out.push(a + (b - a) * frac);
        }
    }

    out
}
