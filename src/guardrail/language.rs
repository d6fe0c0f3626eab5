use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use super::classifier::{classify_as, Classifier};
use super::{Guardrail, GuardrailContext, GuardrailOutput};
use crate::config::GuardrailConfig;
use crate::error::ClassifierError;
use crate::transcript::store::user_utterances;

/// Short acknowledgements that say nothing about the conversation language
const ACK_TOKENS: &[&str] = &[
    "ok", "okay", "k", "yes", "yeah", "yep", "no", "nope", "sure", "hmm", "hm", "mhm", "uh-huh",
    "thanks", "done", "haan", "han", "ha", "ji", "haanji", "accha", "acha", "achha", "theek",
    "thik", "nahi", "si", "oui", "ja",
];

/// Result of classifying a piece of text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageClassification {
    pub language: String,
    #[serde(default, alias = "iso", alias = "isoCode")]
    pub iso_code: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// The conversation language, established once per session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageLock {
    pub language: String,
    pub iso_code: Option<String>,
    pub confidence: Option<f32>,
}

impl From<LanguageClassification> for LanguageLock {
    fn from(c: LanguageClassification) -> Self {
        Self {
            language: c.language,
            iso_code: c.iso_code,
            confidence: c.confidence,
        }
    }
}

/// Write-once holder for the session's `LanguageLock`.
///
/// Concurrent checks may race to establish it; the first write wins and
/// every caller gets the value that is current after its own attempt. Nobody
/// waits on another check's classifier call.
#[derive(Debug, Default)]
pub struct LanguageLockCell {
    inner: OnceLock<LanguageLock>,
}

impl LanguageLockCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<&LanguageLock> {
        self.inner.get()
    }

    pub fn is_established(&self) -> bool {
        self.inner.get().is_some()
    }

    /// Try to establish `lock`; returns the lock now in force
    pub fn establish(&self, lock: LanguageLock) -> &LanguageLock {
        let mut ours = false;
        let current = self.inner.get_or_init(|| {
            ours = true;
            lock
        });
        if ours {
            info!(
                "Language lock established: {} ({})",
                current.language,
                current.iso_code.as_deref().unwrap_or("?")
            );
        } else {
            debug!("Language lock already established as {}", current.language);
        }
        current
    }
}

/// Tunables of the language-lock check
#[derive(Debug, Clone)]
pub struct LanguagePolicy {
    pub confidence_floor: f32,
    pub min_lock_utterance_chars: usize,
    pub ack_max_chars: usize,
    pub ack_tokens: Vec<String>,
}

impl Default for LanguagePolicy {
    fn default() -> Self {
        Self {
            confidence_floor: 0.55,
            min_lock_utterance_chars: 8,
            ack_max_chars: 8,
            ack_tokens: ACK_TOKENS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl From<&GuardrailConfig> for LanguagePolicy {
    fn from(cfg: &GuardrailConfig) -> Self {
        let mut ack_tokens: Vec<String> = ACK_TOKENS.iter().map(|t| t.to_string()).collect();
        ack_tokens.extend(cfg.extra_ack_tokens.iter().map(|t| t.trim().to_lowercase()));

        Self {
            confidence_floor: cfg.confidence_floor,
            min_lock_utterance_chars: cfg.min_lock_utterance_chars,
            ack_max_chars: cfg.ack_max_chars,
            ack_tokens,
        }
    }
}

/// Text that carries no language signal: blank, only digits/punctuation/
/// whitespace, or a short acknowledgement token.
pub fn is_language_agnostic(text: &str, policy: &LanguagePolicy) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }

    if trimmed.chars().all(|c| !c.is_alphabetic()) {
        return true;
    }

    if trimmed.chars().count() > policy.ack_max_chars {
        return false;
    }

    let token = trimmed
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_lowercase();
    policy.ack_tokens.iter().any(|ack| *ack == token)
}

/// First utterance long enough to classify reliably, else the first one
pub fn pick_lock_source(utterances: &[String], min_chars: usize) -> Option<&str> {
    utterances
        .iter()
        .find(|u| u.trim().chars().count() >= min_chars)
        .or_else(|| utterances.first())
        .map(String::as_str)
}

fn normalize_iso(code: Option<&str>) -> Option<String> {
    let code = code?.trim().to_lowercase();
    let primary = code.split(|c: char| c == '-' || c == '_').next().unwrap_or_default();
    if primary.is_empty() {
        None
    } else {
        Some(primary.to_string())
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Comparison of a candidate's classification against the lock
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LanguageComparison {
    pub iso_mismatch: bool,
    pub name_mismatch: bool,
    pub confidence: f32,
    pub trips: bool,
}

impl LanguageComparison {
    /// Trips iff (iso mismatch or name mismatch) and confidence reaches the
    /// floor. A missing confidence counts as 0.
    pub fn evaluate(lock: &LanguageLock, detected: &LanguageClassification, floor: f32) -> Self {
        let iso_mismatch = match (
            normalize_iso(lock.iso_code.as_deref()),
            normalize_iso(detected.iso_code.as_deref()),
        ) {
            (Some(locked), Some(found)) => locked != found,
            _ => false,
        };

        let locked_name = normalize_name(&lock.language);
        let found_name = normalize_name(&detected.language);
        let name_mismatch =
            !locked_name.is_empty() && !found_name.is_empty() && locked_name != found_name;

        let confidence = detected.confidence.unwrap_or(0.0);
        let trips = (iso_mismatch || name_mismatch) && confidence >= floor;

        Self {
            iso_mismatch,
            name_mismatch,
            confidence,
            trips,
        }
    }
}

fn language_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "language": { "type": "string", "description": "English display name of the language" },
            "iso_code": { "type": ["string", "null"], "description": "ISO 639-1 code" },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
        },
        "required": ["language", "iso_code", "confidence"],
        "additionalProperties": false
    })
}

/// Keeps the agent speaking the language the user started the session in
pub struct LanguageLockGuardrail {
    classifier: Arc<dyn Classifier>,
    policy: LanguagePolicy,
}

impl LanguageLockGuardrail {
    pub const NAME: &'static str = "language_lock_guardrail";

    pub fn new(classifier: Arc<dyn Classifier>, policy: LanguagePolicy) -> Self {
        Self { classifier, policy }
    }

    async fn classify(&self, text: &str) -> Result<LanguageClassification, ClassifierError> {
        classify_as(self.classifier.as_ref(), text, language_schema()).await
    }
}

#[async_trait::async_trait]
impl Guardrail for LanguageLockGuardrail {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn check(
        &self,
        candidate: &str,
        context: &GuardrailContext,
    ) -> Result<GuardrailOutput, ClassifierError> {
        if is_language_agnostic(candidate, &self.policy) {
            return Ok(GuardrailOutput::pass(
                Self::NAME,
                json!({ "skipped": "language_agnostic" }),
            ));
        }

        let lock = match context.language_lock.get() {
            Some(lock) => lock.clone(),
            None => {
                let utterances = user_utterances(&context.history);
                let min_chars = self.policy.min_lock_utterance_chars;
                let Some(source) = pick_lock_source(&utterances, min_chars) else {
                    return Ok(GuardrailOutput::pass(
                        Self::NAME,
                        json!({ "skipped": "no_user_utterance" }),
                    ));
                };
                let detected = self.classify(source).await?;
                context.language_lock.establish(detected.into()).clone()
            }
        };

        let detected = self.classify(candidate).await?;
        let comparison =
            LanguageComparison::evaluate(&lock, &detected, self.policy.confidence_floor);

        let info = json!({
            "reason": if comparison.trips { "language_mismatch" } else { "language_ok" },
            "locked_language": lock.language,
            "locked_iso_code": lock.iso_code,
            "detected_language": detected.language,
            "detected_iso_code": detected.iso_code,
            "confidence": comparison.confidence,
            "iso_mismatch": comparison.iso_mismatch,
            "name_mismatch": comparison.name_mismatch,
        });

        if comparison.trips {
            info!(
                "Language mismatch: locked {} but agent produced {} ({:.2})",
                lock.language, detected.language, comparison.confidence
            );
            Ok(GuardrailOutput::trip(Self::NAME, "language_mismatch", info))
        } else {
            if comparison.iso_mismatch || comparison.name_mismatch {
                debug!(
                    "Low-confidence language mismatch ignored: {} ({:.2})",
                    detected.language, comparison.confidence
                );
            }
            Ok(GuardrailOutput::pass(Self::NAME, info))
        }
    }
}
