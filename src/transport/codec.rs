use serde::{Deserialize, Serialize};
use tracing::warn;

/// Audio codec negotiated once when the session controller is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    #[default]
    Opus,
    /// G.711 mu-law, 8kHz narrowband (telephony)
    Pcmu,
    /// G.711 A-law, 8kHz narrowband (telephony)
    Pcma,
}

impl AudioCodec {
    /// Resolve a configured preference string. Unknown values fall back to Opus.
    pub fn resolve(preference: &str) -> Self {
        match preference.trim().to_ascii_lowercase().as_str() {
            "" | "opus" => AudioCodec::Opus,
            "pcmu" | "g711_ulaw" => AudioCodec::Pcmu,
            "pcma" | "g711_alaw" => AudioCodec::Pcma,
            other => {
                warn!("Unknown codec preference '{}', falling back to opus", other);
                AudioCodec::Opus
            }
        }
    }

    /// Audio format name the agent engine expects for this codec
    pub fn audio_format(self) -> &'static str {
        match self {
            AudioCodec::Opus => "pcm16",
            AudioCodec::Pcmu => "g711_ulaw",
            AudioCodec::Pcma => "g711_alaw",
        }
    }

    pub fn sample_rate(self) -> u32 {
        match self {
            AudioCodec::Opus => 48000,
            AudioCodec::Pcmu | AudioCodec::Pcma => 8000,
        }
    }
}
