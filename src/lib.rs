pub mod audio;
pub mod config;
pub mod error;
pub mod guardrail;
pub mod session;
pub mod transcript;
pub mod transport;

pub use audio::{
    AudioFile, AudioFrame, AudioRecorder, AudioStreamSource, DeniedMicrophone, FileMicrophone,
    MicrophoneSource, RecorderConfig, Recording,
};
pub use config::Config;
pub use error::{AudioError, ClassifierError, ConnectionError};
pub use guardrail::{
    Classifier, Guardrail, GuardrailContext, GuardrailOutput, GuardrailPipeline, GuardrailVerdict,
    HttpClassifier, LanguageLockGuardrail, ModerationGuardrail,
};
pub use session::{
    AgentConfig, SessionConfig, SessionController, SessionEvent, SessionStats, SessionStatus,
};
pub use transcript::{ItemKind, ItemStatus, Role, TranscriptItem, TranscriptStore};
pub use transport::{
    AudioCodec, ChannelTransport, ChannelTransportFactory, ClientEvent, CredentialProvider,
    EphemeralCredential, HttpCredentialProvider, NatsTransportFactory, Transport,
    TransportEvent, TransportFactory,
};
