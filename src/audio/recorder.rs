use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{acquire_or_silence, AudioFrame, AudioStreamSource, MicrophoneSource};
use super::chunk::{ChunkConfig, EncodedChunk, TimesliceEncoder};
use super::export::{render_recording, Recording};
use super::mixer::{AudioMixer, MixerConfig};
use crate::config::RecordingConfig;
use crate::error::AudioError;

/// Recorder configuration
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Mixing and chunk sample rate
    pub sample_rate: u32,
    /// Mixing and chunk channel count
    pub channels: u16,
    pub timeslice_ms: u64,
    /// Slack one source may build up while the other is silent
    pub max_buffered_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            timeslice_ms: 1000,
            max_buffered_ms: 2000,
        }
    }
}

impl From<&RecordingConfig> for RecorderConfig {
    fn from(config: &RecordingConfig) -> Self {
        Self {
            timeslice_ms: config.timeslice_ms,
            ..Self::default()
        }
    }
}

enum CaptureControl {
    Flush(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

struct AudioCapture {
    control_tx: mpsc::Sender<CaptureControl>,
    task: JoinHandle<()>,
}

impl AudioCapture {
    async fn request(&self, make: fn(oneshot::Sender<()>) -> CaptureControl) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.control_tx.send(make(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Captures remote agent speech mixed with the local microphone.
///
/// The mixed stream is encoded into timeslice chunks while recording. The
/// recording finishes on `stop()` or when the remote stream ends, which
/// happens when the session is torn down. Chunks survive either and are only
/// discarded when a new recording starts.
pub struct AudioRecorder {
    config: RecorderConfig,
    microphone: Arc<dyn MicrophoneSource>,
    capture: Option<AudioCapture>,
    chunks: Arc<Mutex<Vec<EncodedChunk>>>,
    local_silent: bool,
}

impl AudioRecorder {
    pub fn new(config: RecorderConfig, microphone: Arc<dyn MicrophoneSource>) -> Self {
        Self {
            config,
            microphone,
            capture: None,
            chunks: Arc::new(Mutex::new(Vec::new())),
            local_silent: false,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.capture
            .as_ref()
            .is_some_and(|capture| !capture.task.is_finished())
    }

    /// True when the microphone could not be acquired and only remote audio is captured
    pub fn is_local_silent(&self) -> bool {
        self.local_silent
    }

    pub async fn chunk_count(&self) -> usize {
        self.chunks.lock().await.len()
    }

    /// Begin capturing. A second call while recording is a no-op.
    ///
    /// Microphone permission or device failures are not fatal: the recording
    /// continues with a silent local source.
    pub async fn start(&mut self, remote: mpsc::Receiver<AudioFrame>) {
        if self.is_recording() {
            debug!("Recorder already running, ignoring start");
            return;
        }
        if let Some(finished) = self.capture.take() {
            let _ = finished.task.await;
        }

        self.chunks.lock().await.clear();

        let (local, local_silent) = acquire_or_silence(self.microphone.as_ref()).await;
        self.local_silent = local_silent;

        let mixer = AudioMixer::new(
            MixerConfig {
                sample_rate: self.config.sample_rate,
                channels: self.config.channels,
                max_buffered_ms: self.config.max_buffered_ms,
            },
            &[AudioStreamSource::Remote, AudioStreamSource::Local],
        );
        let encoder = TimesliceEncoder::new(ChunkConfig {
            timeslice_ms: self.config.timeslice_ms,
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
        });

        let (control_tx, control_rx) = mpsc::channel(8);
        let task = tokio::spawn(run_capture(
            mixer,
            encoder,
            [remote, local],
            control_rx,
            Arc::clone(&self.chunks),
        ));

        info!(
            "Recording started ({}Hz, {} channels, {}ms timeslices{})",
            self.config.sample_rate,
            self.config.channels,
            self.config.timeslice_ms,
            if local_silent { ", remote only" } else { "" }
        );

        self.capture = Some(AudioCapture { control_tx, task });
    }

    /// Stop capturing, flushing any buffered audio into a final chunk.
    /// Calling it when not recording is a no-op.
    pub async fn stop(&mut self) {
        let Some(capture) = self.capture.take() else {
            debug!("Recorder not running, ignoring stop");
            return;
        };

        capture.request(CaptureControl::Stop).await;
        if let Err(e) = capture.task.await {
            warn!("Capture task ended abnormally: {}", e);
        }

        info!("Recording stopped ({} chunks)", self.chunks.lock().await.len());
    }

    /// Render everything captured so far into a mono 16-bit WAV.
    ///
    /// Returns `Ok(None)` when nothing was captured.
    pub async fn export(&mut self) -> Result<Option<Recording>, AudioError> {
        if let Some(capture) = &self.capture {
            capture.request(CaptureControl::Flush).await;
        }

        let chunks = self.chunks.lock().await.clone();
        if chunks.is_empty() {
            warn!("No recorded chunks to export");
            return Ok(None);
        }

        let recording = tokio::task::spawn_blocking(move || render_recording(&chunks, Utc::now()))
            .await
            .map_err(|e| AudioError::Encode(format!("export task failed: {}", e)))??;

        info!(
            "Exported recording {} ({:.1}s)",
            recording.file_name,
            recording.duration_seconds()
        );
        Ok(Some(recording))
    }
}

impl Drop for AudioRecorder {
    fn drop(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.task.abort();
        }
    }
}

const SOURCES: [AudioStreamSource; 2] = [AudioStreamSource::Remote, AudioStreamSource::Local];

async fn run_capture(
    mut mixer: AudioMixer,
    mut encoder: TimesliceEncoder,
    mut streams: [mpsc::Receiver<AudioFrame>; 2],
    mut control: mpsc::Receiver<CaptureControl>,
    chunks: Arc<Mutex<Vec<EncodedChunk>>>,
) {
    let mut open = [true, true];

    loop {
        let [remote, local] = &mut streams;

        tokio::select! {
            biased;

            frame = remote.recv(), if open[0] => {
                let session_ended = frame.is_none();
                accept(&mut mixer, 0, frame, &mut open);

                if session_ended {
                    // Microphone audio after this point is not part of the call
                    take_queued(&mut mixer, &mut streams, &mut open);
                    flush_all(&mut mixer, &mut encoder, &chunks).await;
                    info!("Remote audio ended, recording finished");
                    break;
                }
                mix_ready(&mut mixer, &mut encoder, &chunks).await;
            }

            frame = local.recv(), if open[1] => {
                accept(&mut mixer, 1, frame, &mut open);
                mix_ready(&mut mixer, &mut encoder, &chunks).await;
            }

            command = control.recv() => {
                take_queued(&mut mixer, &mut streams, &mut open);
                flush_all(&mut mixer, &mut encoder, &chunks).await;

                match command {
                    Some(CaptureControl::Flush(ack)) => {
                        let _ = ack.send(());
                    }
                    Some(CaptureControl::Stop(ack)) => {
                        let _ = ack.send(());
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    debug!("Capture task finished");
}

fn accept(mixer: &mut AudioMixer, index: usize, frame: Option<AudioFrame>, open: &mut [bool; 2]) {
    let source = SOURCES[index];
    match frame {
        Some(mut frame) => {
            frame.source = source;
            mixer.push(frame);
        }
        None => {
            open[index] = false;
            mixer.mark_closed(source);
        }
    }
}

/// Frames already queued belong to this recording
fn take_queued(
    mixer: &mut AudioMixer,
    streams: &mut [mpsc::Receiver<AudioFrame>; 2],
    open: &mut [bool; 2],
) {
    for (index, stream) in streams.iter_mut().enumerate() {
        while open[index] {
            match stream.try_recv() {
                Ok(frame) => accept(mixer, index, Some(frame), open),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => accept(mixer, index, None, open),
            }
        }
    }
}

async fn mix_ready(
    mixer: &mut AudioMixer,
    encoder: &mut TimesliceEncoder,
    chunks: &Mutex<Vec<EncodedChunk>>,
) {
    while let Some(mixed) = mixer.next_ready() {
        store(encoder.push(&mixed), chunks).await;
    }
}

async fn flush_all(
    mixer: &mut AudioMixer,
    encoder: &mut TimesliceEncoder,
    chunks: &Mutex<Vec<EncodedChunk>>,
) {
    if let Some(mixed) = mixer.drain() {
        store(encoder.push(&mixed), chunks).await;
    }
    store(encoder.flush(), chunks).await;
}

async fn store(
    result: Result<Option<EncodedChunk>, AudioError>,
    chunks: &Mutex<Vec<EncodedChunk>>,
) {
    match result {
        Ok(Some(chunk)) => chunks.lock().await.push(chunk),
        Ok(None) => {}
        Err(e) => error!("Failed to encode audio chunk: {}", e),
    }
}
