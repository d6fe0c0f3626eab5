// Recording export
//
// Captured timeslice chunks are decoded back to float samples, downmixed to
// mono and re-encoded as a 16-bit PCM WAV file.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, info};

use super::chunk::EncodedChunk;
use crate::error::AudioError;

/// Size of the canonical PCM WAV header
pub const WAV_HEADER_SIZE: usize = 44;

/// Decoded interleaved float audio
#[derive(Debug, Clone, Default)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

/// A finished mono 16-bit WAV recording
#[derive(Debug, Clone)]
pub struct Recording {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub sample_rate: u32,
    /// Mono samples in the data chunk
    pub sample_count: usize,
}

impl Recording {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.sample_count as f64 / self.sample_rate as f64
    }

    /// Write the recording into `dir` under its own file name
    pub fn save_to(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

        let path = dir.join(&self.file_name);
        std::fs::write(&path, &self.bytes)
            .with_context(|| format!("Failed to write recording: {}", path.display()))?;

        info!(
            "Recording saved: {} ({:.1}s, {} bytes)",
            path.display(),
            self.duration_seconds(),
            self.bytes.len()
        );
        Ok(path)
    }
}

/// `voice-recording-<ISO timestamp>.wav` with `:` and `.` replaced by `-`
pub fn recording_file_name(at: DateTime<Utc>) -> String {
    let stamp = at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace(':', "-")
        .replace('.', "-");
    format!("voice-recording-{}.wav", stamp)
}

/// Decode every chunk in order and concatenate the samples
pub fn decode_chunks(chunks: &[EncodedChunk]) -> Result<DecodedAudio, AudioError> {
    let mut audio = DecodedAudio::default();

    for chunk in chunks {
        let decoded = decode_chunk(&chunk.bytes)?;
        if audio.samples.is_empty() && audio.sample_rate == 0 {
            audio.sample_rate = decoded.sample_rate;
            audio.channels = decoded.channels;
        } else if decoded.sample_rate != audio.sample_rate || decoded.channels != audio.channels {
            return Err(AudioError::Decode(format!(
                "chunk {} format {}Hz/{}ch differs from {}Hz/{}ch",
                chunk.chunk_index,
                decoded.sample_rate,
                decoded.channels,
                audio.sample_rate,
                audio.channels
            )));
        }
        audio.samples.extend_from_slice(&decoded.samples);
    }

    debug!(
        "Decoded {} chunks: {} samples, {}Hz, {} channels",
        chunks.len(),
        audio.samples.len(),
        audio.sample_rate,
        audio.channels
    );
    Ok(audio)
}

/// Decode one self-contained encoded chunk
pub fn decode_chunk(bytes: &[u8]) -> Result<DecodedAudio, AudioError> {
    let stream = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());

    let mut hint = Hint::new();
    hint.with_extension("wav");

    let probed = symphonia::default::get_probe().format(
        &hint,
        stream,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AudioError::Decode("no audio track in chunk".to_string()))?;
    let track_id = track.id;
    let mut audio = DecodedAudio {
        samples: Vec::new(),
        sample_rate: track.codec_params.sample_rate.unwrap_or(0),
        channels: track.codec_params.channels.map(|c| c.count()).unwrap_or(0),
    };

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder.decode(&packet)?;
        let spec = *decoded.spec();
        audio.sample_rate = spec.rate;
        audio.channels = spec.channels.count();

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        audio.samples.extend_from_slice(buffer.samples());
    }

    Ok(audio)
}

/// Downmix interleaved multi-channel audio to mono by averaging channels per frame.
pub fn downmix_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Clamp to [-1, 1], then scale asymmetrically so both extremes are reachable
pub fn float_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// 16-bit PCM mono WAV: a 44-byte header followed by 2 bytes per sample
pub fn encode_wav_mono16(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut bytes = Vec::with_capacity(WAV_HEADER_SIZE + samples.len() * 2);
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec)?;
        let mut pcm = writer.get_i16_writer(samples.len() as u32);
        for &sample in samples {
            pcm.write_sample(float_to_pcm16(sample));
        }
        pcm.flush()?;
        writer.finalize()?;
    }
    Ok(bytes)
}

/// Full export: decode, downmix, encode
pub fn render_recording(
    chunks: &[EncodedChunk],
    at: DateTime<Utc>,
) -> Result<Recording, AudioError> {
    let decoded = decode_chunks(chunks)?;
    let mono = downmix_to_mono(&decoded.samples, decoded.channels);
    let bytes = encode_wav_mono16(&mono, decoded.sample_rate)?;

    Ok(Recording {
        file_name: recording_file_name(at),
        bytes,
        sample_rate: decoded.sample_rate,
        sample_count: mono.len(),
    })
}
