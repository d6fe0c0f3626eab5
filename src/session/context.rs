use std::sync::Arc;

use crate::guardrail::{GuardrailContext, LanguageLockCell};
use crate::transcript::TranscriptItem;
use crate::transport::AudioCodec;

/// Session-scoped state shared with guardrail checks.
///
/// Created fresh by every `connect()`, so the language lock never outlives
/// the session that established it.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub codec: AudioCodec,
    pub language_lock: Arc<LanguageLockCell>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, codec: AudioCodec) -> Self {
        Self {
            session_id: session_id.into(),
            codec,
            language_lock: Arc::new(LanguageLockCell::new()),
        }
    }

    pub fn guardrail_context(&self, history: Vec<TranscriptItem>) -> GuardrailContext {
        GuardrailContext {
            history,
            language_lock: Arc::clone(&self.language_lock),
        }
    }
}
