//! Output guardrails
//!
//! Candidate agent text is checked by every registered guardrail
//! concurrently before it reaches the user. The verdict is the OR of all
//! tripwires and is only final once every check has resolved.

mod classifier;
mod language;
mod moderation;
mod pipeline;

pub use classifier::{classify_as, Classifier, ClassifierRequest, HttpClassifier};
pub use language::{
    is_language_agnostic, pick_lock_source, LanguageClassification, LanguageComparison,
    LanguageLock, LanguageLockCell, LanguageLockGuardrail, LanguagePolicy,
};
pub use moderation::{ModerationCategory, ModerationGuardrail, ModerationResult};
pub use pipeline::GuardrailPipeline;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::ClassifierError;
use crate::transcript::TranscriptItem;

/// Outcome of a single check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailOutput {
    pub name: String,
    pub tripwire_triggered: bool,
    pub reason: Option<String>,
    /// Diagnostic payload
    pub output_info: Value,
}

impl GuardrailOutput {
    pub fn pass(name: impl Into<String>, output_info: Value) -> Self {
        Self {
            name: name.into(),
            tripwire_triggered: false,
            reason: None,
            output_info,
        }
    }

    pub fn trip(name: impl Into<String>, reason: impl Into<String>, output_info: Value) -> Self {
        Self {
            name: name.into(),
            tripwire_triggered: true,
            reason: Some(reason.into()),
            output_info,
        }
    }

    /// Non-tripping outcome for a check whose classifier failed
    pub fn classifier_failure(name: impl Into<String>, error: &ClassifierError) -> Self {
        Self::pass(name, json!({ "error": error.to_string() }))
    }
}

/// Combined verdict across all checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    pub tripwire_triggered: bool,
    /// Reason of the first tripped check, in registration order
    pub reason: Option<String>,
    pub checks: Vec<GuardrailOutput>,
}

impl GuardrailVerdict {
    pub fn from_outputs(checks: Vec<GuardrailOutput>) -> Self {
        let tripped = checks.iter().find(|c| c.tripwire_triggered);

        Self {
            tripwire_triggered: tripped.is_some(),
            reason: tripped.map(|c| c.reason.clone().unwrap_or_else(|| c.name.clone())),
            checks,
        }
    }

    /// Verdict when no guardrails are registered
    pub fn empty() -> Self {
        Self::from_outputs(Vec::new())
    }

    pub fn check(&self, name: &str) -> Option<&GuardrailOutput> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// What a check may consult besides the candidate text
#[derive(Debug, Clone, Default)]
pub struct GuardrailContext {
    /// Transcript snapshot taken when the candidate arrived
    pub history: Vec<TranscriptItem>,
    /// Session-lifetime language lock
    pub language_lock: Arc<LanguageLockCell>,
}

/// Async check against candidate agent output
#[async_trait::async_trait]
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;

    async fn check(
        &self,
        candidate: &str,
        context: &GuardrailContext,
    ) -> Result<GuardrailOutput, ClassifierError>;
}
