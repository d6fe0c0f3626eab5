use thiserror::Error;

/// Failure while standing up a session. The controller is back in
/// `Disconnected` by the time one of these reaches the caller, so `connect()`
/// may simply be retried.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to fetch ephemeral credential: {0:#}")]
    Credential(#[source] anyhow::Error),

    #[error("transport handshake failed: {0:#}")]
    Handshake(#[source] anyhow::Error),

    #[error("connection attempt was aborted by disconnect()")]
    Aborted,
}

/// Failure of the external classifier service used by guardrail checks.
///
/// The guardrail pipeline never propagates these; they are folded into a
/// non-tripping verdict carrying the message as a diagnostic.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier unreachable: {0}")]
    Unreachable(String),

    #[error("classifier rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("classifier returned an unparseable response: {0}")]
    Unparseable(String),
}

impl From<reqwest::Error> for ClassifierError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ClassifierError::Rejected {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None if err.is_decode() => ClassifierError::Unparseable(err.to_string()),
            None => ClassifierError::Unreachable(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClassifierError {
    fn from(err: serde_json::Error) -> Self {
        ClassifierError::Unparseable(err.to_string())
    }
}

/// Audio capture and export failures
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("failed to decode captured audio: {0}")]
    Decode(String),

    #[error("failed to encode recording: {0}")]
    Encode(String),
}

impl From<hound::Error> for AudioError {
    fn from(err: hound::Error) -> Self {
        AudioError::Encode(err.to_string())
    }
}

impl From<symphonia::core::errors::Error> for AudioError {
    fn from(err: symphonia::core::errors::Error) -> Self {
        AudioError::Decode(err.to_string())
    }
}
