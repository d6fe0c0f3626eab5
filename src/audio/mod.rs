pub mod backend;
pub mod chunk;
pub mod export;
pub mod file;
pub mod mixer;
pub mod recorder;

pub use backend::{
    acquire_or_silence, AudioFrame, AudioStreamSource, DeniedMicrophone, FileMicrophone,
    MicrophoneSource,
};
pub use chunk::{ChunkConfig, EncodedChunk, TimesliceEncoder};
pub use export::{
    decode_chunks, downmix_to_mono, encode_wav_mono16, float_to_pcm16, recording_file_name,
    render_recording, DecodedAudio, Recording, WAV_HEADER_SIZE,
};
pub use file::AudioFile;
pub use mixer::{AudioMixer, MixerConfig};
pub use recorder::{AudioRecorder, RecorderConfig};
