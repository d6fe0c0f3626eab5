use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::SessionStatus;

/// Statistics about a voice session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub status: SessionStatus,

    /// Identifier of the live session, if any
    pub session_id: Option<String>,

    /// When the live session was established
    pub started_at: Option<DateTime<Utc>>,

    /// Total duration in seconds
    pub duration_secs: f64,

    /// Number of transcript items currently held
    pub transcript_items: usize,

    /// Agent utterances withheld by a guardrail since the controller was built
    pub guardrail_trips: usize,

    /// Agent currently in control after handoffs
    pub active_agent: Option<String>,
}
