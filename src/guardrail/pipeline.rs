use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

use super::classifier::Classifier;
use super::language::{LanguageLockGuardrail, LanguagePolicy};
use super::moderation::ModerationGuardrail;
use super::{Guardrail, GuardrailContext, GuardrailOutput, GuardrailVerdict};
use crate::config::GuardrailConfig;

/// Runs every registered guardrail concurrently against the same candidate.
///
/// No short-circuit: all checks run to completion so every diagnostic is
/// available. A failing check counts as not tripped.
#[derive(Clone, Default)]
pub struct GuardrailPipeline {
    checks: Vec<Arc<dyn Guardrail>>,
}

impl GuardrailPipeline {
    pub fn new(checks: Vec<Arc<dyn Guardrail>>) -> Self {
        Self { checks }
    }

    /// Build the configured checks on top of one classifier
    pub fn from_config(config: &GuardrailConfig, classifier: Arc<dyn Classifier>) -> Self {
        let mut checks: Vec<Arc<dyn Guardrail>> = Vec::new();

        if config.moderation {
            checks.push(Arc::new(ModerationGuardrail::new(Arc::clone(&classifier))));
        }
        if config.language_lock {
            checks.push(Arc::new(LanguageLockGuardrail::new(
                classifier,
                LanguagePolicy::from(config),
            )));
        }

        info!("Guardrail pipeline configured with {} checks", checks.len());
        Self { checks }
    }

    pub fn with(mut self, check: Arc<dyn Guardrail>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.checks.iter().map(|c| c.name().to_string()).collect()
    }

    /// Verdict for `candidate`. Resolves only after every check resolved.
    pub async fn run(&self, candidate: &str, context: &GuardrailContext) -> GuardrailVerdict {
        let runs = self.checks.iter().map(|check| async move {
            match check.check(candidate, context).await {
                Ok(output) => output,
                Err(e) => {
                    warn!("Guardrail {} failed, not tripping: {}", check.name(), e);
                    GuardrailOutput::classifier_failure(check.name(), &e)
                }
            }
        });

        GuardrailVerdict::from_outputs(join_all(runs).await)
    }
}
