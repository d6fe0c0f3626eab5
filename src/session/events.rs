use serde::{Deserialize, Serialize};

use crate::guardrail::GuardrailVerdict;
use crate::transcript::TranscriptItem;

/// Connection state. The only legal cycle is
/// `Disconnected -> Connecting -> Connected -> Disconnected`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Notification broadcast to controller subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StatusChanged { status: SessionStatus },

    /// `item_id` is `None` after a bulk reconciliation
    TranscriptUpdated { item_id: Option<String> },

    /// Agent text that passed every guardrail
    AgentUtterance {
        item_id: String,
        text: String,
        verdict: GuardrailVerdict,
    },

    /// Agent text withheld; in-flight speech was interrupted
    GuardrailTripped {
        item_id: String,
        verdict: GuardrailVerdict,
    },

    AgentHandoff { agent: String },

    TransportError { message: String, fatal: bool },

    /// The live session ended without `disconnect()` being called. Carries
    /// the transcript as it stood; the store itself is cleared.
    Disconnected {
        reason: String,
        transcript: Vec<TranscriptItem>,
    },
}
