use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use super::classifier::{classify_as, Classifier};
use super::{Guardrail, GuardrailContext, GuardrailOutput};
use crate::error::ClassifierError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModerationCategory {
    Offensive,
    OffBrand,
    Violence,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationResult {
    #[serde(alias = "moderationCategory", alias = "category")]
    pub moderation_category: ModerationCategory,
    #[serde(default, alias = "moderationRationale", alias = "rationale")]
    pub moderation_rationale: String,
}

fn moderation_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "moderation_rationale": { "type": "string" },
            "moderation_category": {
                "type": "string",
                "enum": ["OFFENSIVE", "OFF_BRAND", "VIOLENCE", "NONE"]
            }
        },
        "required": ["moderation_rationale", "moderation_category"],
        "additionalProperties": false
    })
}

/// Trips on any category other than `NONE`
pub struct ModerationGuardrail {
    classifier: Arc<dyn Classifier>,
}

impl ModerationGuardrail {
    pub const NAME: &'static str = "moderation_guardrail";

    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self { classifier }
    }
}

#[async_trait::async_trait]
impl Guardrail for ModerationGuardrail {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn check(
        &self,
        candidate: &str,
        _context: &GuardrailContext,
    ) -> Result<GuardrailOutput, ClassifierError> {
        let result: ModerationResult =
            classify_as(self.classifier.as_ref(), candidate, moderation_schema()).await?;

        let info = serde_json::to_value(&result)?;
        Ok(match result.moderation_category {
            ModerationCategory::None => GuardrailOutput::pass(Self::NAME, info),
            category => {
                let reason = serde_json::to_value(category)?
                    .as_str()
                    .unwrap_or("MODERATION")
                    .to_string();
                GuardrailOutput::trip(Self::NAME, reason, info)
            }
        })
    }
}
