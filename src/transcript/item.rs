use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::guardrail::GuardrailVerdict;

/// Speaker of a transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemKind {
    Message,
    /// Collapsible marker in the log, e.g. a function call result
    Breadcrumb,
    ToolCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    InProgress,
    Done,
}

/// One unit of conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptItem {
    pub item_id: String,
    pub kind: ItemKind,
    pub role: Option<Role>,
    /// Text, progressively appended while the item is in flight
    pub content: String,
    /// Structured payload (tool arguments, results)
    pub data: Option<Value>,
    /// Sort key
    pub created_at_ms: u64,
    pub status: ItemStatus,
    /// Breadcrumbs start collapsed
    pub expanded: bool,
    pub is_hidden: bool,
    pub guardrail_verdict: Option<GuardrailVerdict>,
}

const WITHHELD_NOTICE: &str = "[response withheld by guardrail]";
const TRANSCRIBING_PLACEHOLDER: &str = "[Transcribing...]";

impl TranscriptItem {
    pub fn message(
        item_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
        created_at_ms: u64,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            kind: ItemKind::Message,
            role: Some(role),
            content: content.into(),
            data: None,
            created_at_ms,
            status: ItemStatus::InProgress,
            expanded: false,
            is_hidden: false,
            guardrail_verdict: None,
        }
    }

    pub fn breadcrumb(
        item_id: impl Into<String>,
        title: impl Into<String>,
        data: Option<Value>,
        created_at_ms: u64,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            kind: ItemKind::Breadcrumb,
            role: None,
            content: title.into(),
            data,
            created_at_ms,
            status: ItemStatus::Done,
            expanded: false,
            is_hidden: false,
            guardrail_verdict: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == ItemStatus::Done
    }

    pub fn is_user_message(&self) -> bool {
        self.kind == ItemKind::Message && self.role == Some(Role::User)
    }

    /// Held for a guardrail verdict, or already carrying one
    pub fn is_reviewed(&self) -> bool {
        self.is_hidden || self.guardrail_verdict.is_some()
    }

    pub fn is_withheld(&self) -> bool {
        self.guardrail_verdict
            .as_ref()
            .is_some_and(|v| v.tripwire_triggered)
    }

    /// Text to show the user. Content is kept intact for audit; a tripped
    /// guardrail only changes what is displayed.
    pub fn display_text(&self) -> &str {
        if self.is_withheld() {
            WITHHELD_NOTICE
        } else if self.is_user_message() && !self.is_done() && self.content.is_empty() {
            TRANSCRIBING_PLACEHOLDER
        } else {
            &self.content
        }
    }
}
