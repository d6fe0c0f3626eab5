use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub transport: TransportConfig,
    pub credentials: CredentialConfig,
    pub guardrails: GuardrailConfig,
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "loqa-voice".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub nats_url: String,
    /// Subjects are `<prefix>.events.<session>` and `<prefix>.commands.<session>`
    pub subject_prefix: String,
    /// Audio codec preference: "opus" (default), "pcmu" or "pcma"
    pub codec: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".to_string(),
            subject_prefix: "voice".to_string(),
            codec: "opus".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Endpoint that mints ephemeral session credentials
    pub endpoint: String,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:3000/api/session".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub classifier_url: String,
    pub classifier_api_key: Option<String>,
    /// Enable the moderation check
    pub moderation: bool,
    /// Enable the language-lock check
    pub language_lock: bool,
    /// Minimum classifier confidence before a language mismatch trips
    pub confidence_floor: f32,
    /// Preferred minimum length of the utterance used to establish the lock
    pub min_lock_utterance_chars: usize,
    /// Longest candidate that can still be treated as an acknowledgement token
    pub ack_max_chars: usize,
    /// Extra acknowledgement tokens on top of the built-in list
    pub extra_ack_tokens: Vec<String>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            classifier_url: "http://localhost:3000/api/classify".to_string(),
            classifier_api_key: None,
            moderation: true,
            language_lock: true,
            confidence_floor: 0.55,
            min_lock_utterance_chars: 8,
            ack_max_chars: 8,
            extra_ack_tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub output_dir: String,
    /// Length of each encoded timeslice held by the recorder
    pub timeslice_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: "recordings".to_string(),
            timeslice_ms: 1000,
        }
    }
}

impl Config {
    /// Load from `path` (any format the `config` crate understands), then apply
    /// `LOQA_VOICE__SECTION__KEY` environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("LOQA_VOICE").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
