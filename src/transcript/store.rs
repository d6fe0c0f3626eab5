use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::{debug, info};

use super::item::{ItemKind, ItemStatus, Role, TranscriptItem};
use crate::guardrail::GuardrailVerdict;
use crate::transport::{HistoryItem, HistoryItemType, TransportEvent};

const HANDOFF_PREFIX: &str = "transfer_to_";
const INAUDIBLE: &str = "[inaudible]";

/// Result of applying one transport event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// A single item was created or changed
    Item(String),
    /// The whole list was reconciled
    Bulk,
    /// The agent handed off to the named agent
    Handoff(String),
    Unchanged,
    /// Not a transcript event; the session handles it
    NotTranscript,
}

pub type HandoffHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Ordered, append-only conversation log materialized from raw transport
/// events.
///
/// Items are always kept sorted by `created_at_ms` (ties keep arrival order).
/// Deltas for an item only append; completing an already finished item is a
/// no-op.
#[derive(Default)]
pub struct TranscriptStore {
    items: Vec<TranscriptItem>,
    on_handoff: Option<HandoffHandler>,
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke `handler` with the target agent name whenever a handoff is seen
    pub fn with_handoff_handler(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_handoff = Some(Box::new(handler));
        self
    }

    pub fn items(&self) -> &[TranscriptItem] {
        &self.items
    }

    pub fn snapshot(&self) -> Vec<TranscriptItem> {
        self.items.clone()
    }

    pub fn get(&self, item_id: &str) -> Option<&TranscriptItem> {
        self.items.iter().find(|i| i.item_id == item_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Non-empty user utterances in chronological order
    pub fn user_utterances(&self) -> Vec<String> {
        user_utterances(&self.items)
    }

    /// Apply one transport event
    pub fn apply(&mut self, event: &TransportEvent) -> Reconciled {
        match event {
            TransportEvent::TranscriptionDelta {
                item_id,
                delta,
                role,
            } => self.apply_delta(item_id, delta, *role),
            TransportEvent::TranscriptionCompleted {
                item_id,
                transcript,
                role,
            } => self.complete(item_id, transcript.as_deref(), *role),
            TransportEvent::HistoryAdded { item } => self.add_history_item(item),
            TransportEvent::HistoryUpdated { history } => self.reconcile_history(history),
            TransportEvent::ToolStart {
                call_id,
                name,
                arguments,
            } => self.tool_start(call_id, name, arguments),
            TransportEvent::ToolEnd {
                call_id,
                name,
                result,
            } => self.tool_end(call_id, name, result),
            TransportEvent::AgentHandoff { history } => self.detect_handoff(history),
            TransportEvent::Unknown { event_type, .. } => {
                debug!("Unhandled transport event: {}", event_type);
                Reconciled::Unchanged
            }
            _ => Reconciled::NotTranscript,
        }
    }

    /// Append partial text. Unknown ids get an in-progress item so deltas
    /// arriving before `history.added` are not lost.
    pub fn apply_delta(&mut self, item_id: &str, delta: &str, role: Option<Role>) -> Reconciled {
        if let Some(item) = self.get_mut(item_id) {
            if item.is_done() {
                debug!("Ignoring late delta for finalized item {}", item_id);
                return Reconciled::Unchanged;
            }
            item.content.push_str(delta);
            return Reconciled::Item(item_id.to_string());
        }

        let item = TranscriptItem::message(
            item_id,
            role.unwrap_or(Role::Assistant),
            delta,
            now_ms(),
        );
        self.insert(item);
        Reconciled::Item(item_id.to_string())
    }

    /// Finalize an item. Idempotent.
    ///
    /// A non-empty transcript is authoritative; otherwise the accumulated
    /// deltas stand.
    pub fn complete(
        &mut self,
        item_id: &str,
        transcript: Option<&str>,
        role: Option<Role>,
    ) -> Reconciled {
        let final_text = transcript.map(|t| if t == "\n" { INAUDIBLE } else { t });

        if let Some(item) = self.get_mut(item_id) {
            if item.is_done() {
                return Reconciled::Unchanged;
            }
            if let Some(text) = final_text.filter(|t| !t.is_empty()) {
                item.content = text.to_string();
            }
            item.status = ItemStatus::Done;
            return Reconciled::Item(item_id.to_string());
        }

        let mut item = TranscriptItem::message(
            item_id,
            role.unwrap_or(Role::Assistant),
            final_text.unwrap_or_default(),
            now_ms(),
        );
        item.status = ItemStatus::Done;
        self.insert(item);
        Reconciled::Item(item_id.to_string())
    }

    /// Record agent text that is about to be surfaced
    pub fn record_agent_output(&mut self, item_id: &str, text: &str) -> Reconciled {
        match self.get_mut(item_id) {
            Some(item) if item.content.is_empty() => {
                item.content = text.to_string();
                Reconciled::Item(item_id.to_string())
            }
            Some(_) => Reconciled::Unchanged,
            None => {
                let mut item = TranscriptItem::message(item_id, Role::Assistant, text, now_ms());
                item.status = ItemStatus::Done;
                self.insert(item);
                Reconciled::Item(item_id.to_string())
            }
        }
    }

    /// Attach the final verdict. Releases an item held for review.
    pub fn set_guardrail_verdict(&mut self, item_id: &str, verdict: GuardrailVerdict) -> bool {
        match self.get_mut(item_id) {
            Some(item) => {
                item.guardrail_verdict = Some(verdict);
                item.is_hidden = false;
                true
            }
            None => false,
        }
    }

    /// Keep an item out of view until its verdict arrives
    pub fn hold_for_review(&mut self, item_id: &str) -> bool {
        match self.get_mut(item_id) {
            Some(item) if item.guardrail_verdict.is_none() => {
                item.is_hidden = true;
                true
            }
            _ => false,
        }
    }

    pub fn toggle_expanded(&mut self, item_id: &str) -> bool {
        match self.get_mut(item_id) {
            Some(item) => {
                item.expanded = !item.expanded;
                true
            }
            None => false,
        }
    }

    pub fn add_history_item(&mut self, history: &HistoryItem) -> Reconciled {
        if let Some(index) = self.position(&history.item_id) {
            let item = &mut self.items[index];
            if let Some(role) = history.role {
                item.role = Some(role);
            }
            if item.content.is_empty() {
                if let Some(content) = history.content.as_deref() {
                    item.content = content.to_string();
                }
            }
            if let Some(created_at_ms) = history.created_at_ms {
                if item.created_at_ms != created_at_ms {
                    item.created_at_ms = created_at_ms;
                    self.resort();
                }
            }
            return Reconciled::Item(history.item_id.clone());
        }

        self.insert(item_from_history(history));
        Reconciled::Item(history.item_id.clone())
    }

    /// Bulk reconciliation against the engine's full history.
    ///
    /// Messages and function calls in `history` are upserted; local messages
    /// missing from it are dropped. Locally generated breadcrumbs, tool call
    /// brackets and agent output under guardrail review (or already judged)
    /// are kept. In-flight text never shrinks.
    pub fn reconcile_history(&mut self, history: &[HistoryItem]) -> Reconciled {
        let incoming: HashSet<&str> = history.iter().map(|h| h.item_id.as_str()).collect();

        self.items.retain(|item| {
            item.kind != ItemKind::Message
                || item.is_reviewed()
                || incoming.contains(item.item_id.as_str())
        });

        for entry in history {
            match self.get_mut(&entry.item_id) {
                Some(item) => {
                    if let Some(role) = entry.role {
                        item.role = Some(role);
                    }
                    if let Some(content) = entry.content.as_deref() {
                        let grows = !item.content.starts_with(content) || item.is_done();
                        if grows && !content.is_empty() {
                            item.content = content.to_string();
                        }
                    }
                    if entry.status == Some(ItemStatus::Done) {
                        item.status = ItemStatus::Done;
                    }
                    if let Some(created_at_ms) = entry.created_at_ms {
                        item.created_at_ms = created_at_ms;
                    }
                }
                None => self.items.push(item_from_history(entry)),
            }
        }

        self.resort();
        Reconciled::Bulk
    }

    pub fn tool_start(&mut self, call_id: &str, name: &str, arguments: &Value) -> Reconciled {
        if self.position(call_id).is_some() {
            return Reconciled::Unchanged;
        }

        let item = TranscriptItem {
            item_id: call_id.to_string(),
            kind: ItemKind::ToolCall,
            role: Some(Role::Tool),
            content: format!("function call: {}", name),
            data: Some(json!({ "arguments": arguments })),
            created_at_ms: now_ms(),
            status: ItemStatus::InProgress,
            expanded: false,
            is_hidden: false,
            guardrail_verdict: None,
        };
        self.insert(item);
        Reconciled::Item(call_id.to_string())
    }

    pub fn tool_end(&mut self, call_id: &str, name: &str, result: &Value) -> Reconciled {
        match self.get_mut(call_id) {
            Some(item) if item.is_done() => return Reconciled::Unchanged,
            Some(item) => {
                item.status = ItemStatus::Done;
                if let Some(Value::Object(data)) = item.data.as_mut() {
                    data.insert("result".to_string(), result.clone());
                }
            }
            None => {
                self.tool_start(call_id, name, &Value::Null);
                if let Some(item) = self.get_mut(call_id) {
                    item.status = ItemStatus::Done;
                    item.data = Some(json!({ "result": result }));
                }
            }
        }

        let breadcrumb = TranscriptItem::breadcrumb(
            format!("{}-result", call_id),
            format!("function call result: {}", name),
            Some(result.clone()),
            now_ms(),
        );
        self.insert(breadcrumb);
        Reconciled::Item(call_id.to_string())
    }

    /// Look at the latest history item's function name for
    /// `transfer_to_<agent>`. Anything else is ignored.
    pub fn detect_handoff(&mut self, history: &[HistoryItem]) -> Reconciled {
        let agent = history
            .last()
            .and_then(|item| item.name.as_deref())
            .and_then(|name| name.strip_prefix(HANDOFF_PREFIX))
            .filter(|agent| !agent.is_empty());

        match agent {
            Some(agent) => {
                info!("Agent handoff detected: {}", agent);
                if let Some(handler) = &self.on_handoff {
                    handler(agent);
                }
                Reconciled::Handoff(agent.to_string())
            }
            None => {
                debug!("Handoff event without a transfer_to_ function call; ignoring");
                Reconciled::Unchanged
            }
        }
    }

    fn position(&self, item_id: &str) -> Option<usize> {
        self.items.iter().position(|i| i.item_id == item_id)
    }

    fn get_mut(&mut self, item_id: &str) -> Option<&mut TranscriptItem> {
        self.items.iter_mut().find(|i| i.item_id == item_id)
    }

    fn insert(&mut self, item: TranscriptItem) {
        let index = self
            .items
            .partition_point(|existing| existing.created_at_ms <= item.created_at_ms);
        self.items.insert(index, item);
    }

    fn resort(&mut self) {
        // Stable: equal timestamps keep arrival order
        self.items.sort_by_key(|item| item.created_at_ms);
    }
}

fn item_from_history(history: &HistoryItem) -> TranscriptItem {
    let created_at_ms = history.created_at_ms.unwrap_or_else(now_ms);

    match history.item_type {
        HistoryItemType::Message => {
            let mut item = TranscriptItem::message(
                history.item_id.clone(),
                history.role.unwrap_or(Role::Assistant),
                history.content.clone().unwrap_or_default(),
                created_at_ms,
            );
            if let Some(status) = history.status {
                item.status = status;
            }
            item
        }
        HistoryItemType::FunctionCall => TranscriptItem::breadcrumb(
            history.item_id.clone(),
            format!("function call: {}", history.name.as_deref().unwrap_or("unknown")),
            history.arguments.clone(),
            created_at_ms,
        ),
    }
}

/// Non-empty user utterances in chronological order
pub fn user_utterances(items: &[TranscriptItem]) -> Vec<String> {
    items
        .iter()
        .filter(|item| item.is_user_message())
        .map(|item| item.content.trim())
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_keeps_created_at_order() {
        let mut store = TranscriptStore::new();
        store.add_history_item(&HistoryItem::message("b", Role::Assistant, "second").at(200));
        store.add_history_item(&HistoryItem::message("a", Role::User, "first").at(100));
        store.add_history_item(&HistoryItem::message("c", Role::User, "third").at(300));

        let ids: Vec<&str> = store.items().iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut store = TranscriptStore::new();
        store.add_history_item(&HistoryItem::message("x", Role::User, "one").at(100));
        store.add_history_item(&HistoryItem::message("y", Role::User, "two").at(100));

        assert_eq!(store.items()[0].item_id, "x");
        assert_eq!(store.items()[1].item_id, "y");
    }

    #[test]
    fn test_inaudible_completion() {
        let mut store = TranscriptStore::new();
        store.complete("u1", Some("\n"), Some(Role::User));
        assert_eq!(store.get("u1").unwrap().content, "[inaudible]");
    }

    #[test]
    fn test_late_delta_after_completion_is_ignored() {
        let mut store = TranscriptStore::new();
        store.apply_delta("a1", "Hello", None);
        store.complete("a1", None, None);
        assert_eq!(store.apply_delta("a1", " again", None), Reconciled::Unchanged);
        assert_eq!(store.get("a1").unwrap().content, "Hello");
    }

    #[test]
    fn test_history_added_merges_into_orphan_delta() {
        let mut store = TranscriptStore::new();
        store.apply_delta("u1", "namaste", None);
        store.add_history_item(&HistoryItem::message("u1", Role::User, ""));

        let item = store.get("u1").unwrap();
        assert_eq!(item.role, Some(Role::User));
        assert_eq!(item.content, "namaste");
        assert_eq!(store.len(), 1);
    }
}
