// Integration tests for the audio recorder
//
// Remote frames are fed through a channel the way the session forwards agent
// speech; the microphone is either refused or replaced by a WAV file.

use anyhow::Result;
use loqa_voice::audio::{
    AudioFrame, AudioRecorder, AudioStreamSource, DeniedMicrophone, FileMicrophone,
    MicrophoneSource, RecorderConfig, WAV_HEADER_SIZE,
};
use loqa_voice::error::AudioError;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn remote_frame(frames: usize, left: f32, right: f32, timestamp_ms: u64) -> AudioFrame {
    let samples = (0..frames).flat_map(|_| [left, right]).collect();
    AudioFrame {
        samples,
        sample_rate: 48000,
        channels: 2,
        timestamp_ms,
        source: AudioStreamSource::Remote,
    }
}

fn pcm16_at(bytes: &[u8], index: usize) -> i16 {
    let offset = WAV_HEADER_SIZE + index * 2;
    i16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

#[tokio::test]
async fn test_export_without_chunks_returns_none() -> Result<()> {
    let mut recorder = AudioRecorder::new(RecorderConfig::default(), Arc::new(DeniedMicrophone));

    assert!(recorder.export().await?.is_none());
    // Stop without start is harmless
    recorder.stop().await;
    assert!(recorder.export().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_denied_microphone_records_remote_only() -> Result<()> {
    let mut recorder = AudioRecorder::new(RecorderConfig::default(), Arc::new(DeniedMicrophone));
    let (tx, rx) = mpsc::channel(64);

    recorder.start(rx).await;
    assert!(recorder.is_recording());
    assert!(recorder.is_local_silent());

    // 1.5 seconds of stereo audio in 100ms frames
    for i in 0..15 {
        tx.send(remote_frame(4800, 0.5, 0.25, i * 100)).await?;
    }
    drop(tx);

    recorder.stop().await;
    recorder.stop().await;
    assert!(!recorder.is_recording());
    assert_eq!(recorder.chunk_count().await, 2, "one full timeslice plus the flushed tail");

    let recording = recorder.export().await?.expect("audio was captured");

    let frames = 15 * 4800;
    assert_eq!(recording.sample_rate, 48000);
    assert_eq!(recording.sample_count, frames);
    assert_eq!(recording.bytes.len(), WAV_HEADER_SIZE + 2 * frames);
    assert!(recording.file_name.starts_with("voice-recording-"));
    assert!(recording.file_name.ends_with(".wav"));
    assert!(!recording.file_name.contains(':'));

    // Mono is the mean of both channels: 0.375 * 32767
    assert_eq!(pcm16_at(&recording.bytes, 0), 12287);
    assert_eq!(pcm16_at(&recording.bytes, frames - 1), 12287);
    Ok(())
}

#[tokio::test]
async fn test_chunks_survive_stop_until_next_start() -> Result<()> {
    let mut recorder = AudioRecorder::new(RecorderConfig::default(), Arc::new(DeniedMicrophone));

    let (tx, rx) = mpsc::channel(8);
    recorder.start(rx).await;
    tx.send(remote_frame(4800, 0.1, 0.1, 0)).await?;
    drop(tx);
    recorder.stop().await;

    let first = recorder.export().await?.expect("captured");
    let again = recorder.export().await?.expect("chunks persist after stop");
    assert_eq!(first.bytes.len(), again.bytes.len());

    // A new recording starts empty
    let (tx, rx) = mpsc::channel(8);
    recorder.start(rx).await;
    drop(tx);
    recorder.stop().await;
    assert!(recorder.export().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_export_while_recording_flushes_pending_audio() -> Result<()> {
    let mut recorder = AudioRecorder::new(RecorderConfig::default(), Arc::new(DeniedMicrophone));
    let (tx, rx) = mpsc::channel(8);

    recorder.start(rx).await;
    // Second start while running is ignored
    let (_other_tx, other_rx) = mpsc::channel(8);
    recorder.start(other_rx).await;

    tx.send(remote_frame(2400, -0.5, -0.5, 0)).await?;

    let recording = recorder.export().await?.expect("pending audio flushed");
    assert_eq!(recording.sample_count, 2400);
    assert_eq!(pcm16_at(&recording.bytes, 0), -16384);
    assert!(recorder.is_recording());

    recorder.stop().await;
    Ok(())
}

async fn wait_until_finished(recorder: &AudioRecorder) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(2), async {
        while recorder.is_recording() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_microphone_frames_mix_under_agent_delta() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let wav_path = temp_dir.path().join("mic.wav");

    // 1s of mono 16-bit audio at a quarter of full scale
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 48000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&wav_path, spec)?;
    for _ in 0..48000 {
        writer.write_sample(8192i16)?;
    }
    writer.finalize()?;

    // Fifty 20ms frames as fast as the file can be read
    let microphone = FileMicrophone::new(&wav_path).realtime(false);
    let mut recorder = AudioRecorder::new(RecorderConfig::default(), Arc::new(microphone));

    let (tx, rx) = mpsc::channel(8);
    recorder.start(rx).await;
    assert!(!recorder.is_local_silent());
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The agent's whole reply lands as a single 1s delta
    tx.send(remote_frame(48000, 0.5, 0.0, 0)).await?;
    drop(tx);
    wait_until_finished(&recorder).await?;

    let recording = recorder.export().await?.expect("call captured");
    assert_eq!(recording.sample_count, 48000, "overlapping audio keeps the call length");
    // L = 0.25 + 0.5, R = 0.25 + 0.0, averaged to 0.5
    assert_eq!(pcm16_at(&recording.bytes, 0), 16383);
    assert_eq!(pcm16_at(&recording.bytes, 24000), 16383);
    assert_eq!(pcm16_at(&recording.bytes, 47999), 16383);

    let saved = recording.save_to(temp_dir.path().join("out"))?;
    assert_eq!(std::fs::read(&saved)?.len(), recording.bytes.len());
    Ok(())
}

/// Microphone whose frames the test pushes by hand
struct HandFedMicrophone {
    frames: std::sync::Mutex<Option<mpsc::Receiver<AudioFrame>>>,
}

impl HandFedMicrophone {
    fn new() -> (Self, mpsc::Sender<AudioFrame>) {
        let (tx, rx) = mpsc::channel(16);
        let microphone = Self {
            frames: std::sync::Mutex::new(Some(rx)),
        };
        (microphone, tx)
    }
}

#[async_trait::async_trait]
impl MicrophoneSource for HandFedMicrophone {
    async fn acquire(&self) -> Result<mpsc::Receiver<AudioFrame>, AudioError> {
        self.frames
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AudioError::Device("already acquired".to_string()))
    }

    fn name(&self) -> &str {
        "hand-fed"
    }
}

fn mic_frame(frames: usize) -> AudioFrame {
    AudioFrame {
        samples: vec![0.25; frames],
        sample_rate: 48000,
        channels: 1,
        timestamp_ms: 0,
        source: AudioStreamSource::Local,
    }
}

#[tokio::test]
async fn test_remote_close_finishes_recording() -> Result<()> {
    let (microphone, mic_tx) = HandFedMicrophone::new();
    let mut recorder = AudioRecorder::new(RecorderConfig::default(), Arc::new(microphone));

    let (tx, rx) = mpsc::channel(8);
    recorder.start(rx).await;

    tx.send(remote_frame(960, 0.25, 0.25, 0)).await?;
    for _ in 0..3 {
        mic_tx.send(mic_frame(960)).await?;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Session teardown drops the remote sender
    drop(tx);
    wait_until_finished(&recorder).await?;
    assert!(mic_tx.send(mic_frame(960)).await.is_err());

    let recording = recorder.export().await?.expect("call captured");
    // Caller audio queued before the end is kept, padded under silence
    assert_eq!(recording.sample_count, 3 * 960);
    assert_eq!(pcm16_at(&recording.bytes, 0), 16383);
    assert_eq!(pcm16_at(&recording.bytes, 960), 8191);

    // Stopping a finished recording is harmless and keeps the chunks
    recorder.stop().await;
    assert!(recorder.export().await?.is_some());
    Ok(())
}
