use serde::{Deserialize, Serialize};

use crate::config::TransportConfig;
use crate::transport::AudioCodec;

/// An agent the remote side may run, sent with the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,

    #[serde(default)]
    pub instructions: String,

    /// Tool names the agent may call
    #[serde(default)]
    pub tools: Vec<String>,

    /// Agents this one may transfer to
    #[serde(default)]
    pub handoffs: Vec<String>,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            tools: Vec::new(),
            handoffs: Vec::new(),
        }
    }

    pub fn with_handoff(mut self, agent: impl Into<String>) -> Self {
        self.handoffs.push(agent.into());
        self
    }
}

/// Configuration for a session controller
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Codec preference, resolved once when the controller is built
    pub codec: AudioCodec,

    /// Capacity of the broadcast channel carrying `SessionEvent`s
    pub event_capacity: usize,

    /// Capacity of the remote audio channel handed to the recorder.
    /// Frames are dropped when the recorder falls behind.
    pub remote_audio_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            codec: AudioCodec::default(),
            event_capacity: 256,
            remote_audio_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn from_transport(transport: &TransportConfig) -> Self {
        Self {
            codec: AudioCodec::resolve(&transport.codec),
            ..Self::default()
        }
    }
}
