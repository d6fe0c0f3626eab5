use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::codec::AudioCodec;
use crate::session::AgentConfig;
use crate::transcript::{ItemStatus, Role};

// ============================================================================
// Inbound events (transport -> session)
// ============================================================================

/// Event received from the realtime transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransportEvent {
    /// Handshake acknowledgement
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Partial transcription text for an item
    #[serde(rename = "transcription.delta")]
    TranscriptionDelta {
        item_id: String,
        delta: String,
        #[serde(default)]
        role: Option<Role>,
    },

    /// Transcription finished for an item
    #[serde(rename = "transcription.completed")]
    TranscriptionCompleted {
        item_id: String,
        #[serde(default)]
        transcript: Option<String>,
        #[serde(default)]
        role: Option<Role>,
    },

    #[serde(rename = "history.added")]
    HistoryAdded { item: HistoryItem },

    /// Full ordered history, used for bulk reconciliation
    #[serde(rename = "history.updated")]
    HistoryUpdated { history: Vec<HistoryItem> },

    #[serde(rename = "agent.tool_start")]
    ToolStart {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },

    #[serde(rename = "agent.tool_end")]
    ToolEnd {
        call_id: String,
        name: String,
        #[serde(default)]
        result: Value,
    },

    /// The agent transferred control; the last history item names the target
    #[serde(rename = "agent.handoff")]
    AgentHandoff { history: Vec<HistoryItem> },

    /// Agent text about to be surfaced; must pass the guardrails first
    #[serde(rename = "agent.output")]
    AgentOutput { item_id: String, text: String },

    /// Agent speech, base64-encoded 16-bit little-endian PCM
    #[serde(rename = "output_audio.delta")]
    OutputAudioDelta {
        audio: String,
        sample_rate: u32,
        #[serde(default = "default_channels")]
        channels: u16,
    },

    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default)]
        fatal: bool,
    },

    /// Anything the session does not recognise. Never produced by serde.
    #[serde(skip)]
    Unknown { event_type: String, payload: Value },
}

fn default_channels() -> u16 {
    1
}

impl TransportEvent {
    /// Parse a raw JSON payload. Malformed or unrecognised payloads become
    /// `Unknown` instead of failing.
    pub fn from_json(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => Self::from_value(value),
            Err(_) => TransportEvent::Unknown {
                event_type: "<malformed>".to_string(),
                payload: Value::String(String::from_utf8_lossy(bytes).into_owned()),
            },
        }
    }

    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<TransportEvent>(value.clone()) {
            Ok(event) => event,
            Err(_) => TransportEvent::Unknown {
                event_type: value
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("<untyped>")
                    .to_string(),
                payload: value,
            },
        }
    }

    /// Wire name of the event, for logging
    pub fn event_type(&self) -> &str {
        match self {
            TransportEvent::SessionCreated { .. } => "session.created",
            TransportEvent::TranscriptionDelta { .. } => "transcription.delta",
            TransportEvent::TranscriptionCompleted { .. } => "transcription.completed",
            TransportEvent::HistoryAdded { .. } => "history.added",
            TransportEvent::HistoryUpdated { .. } => "history.updated",
            TransportEvent::ToolStart { .. } => "agent.tool_start",
            TransportEvent::ToolEnd { .. } => "agent.tool_end",
            TransportEvent::AgentHandoff { .. } => "agent.handoff",
            TransportEvent::AgentOutput { .. } => "agent.output",
            TransportEvent::OutputAudioDelta { .. } => "output_audio.delta",
            TransportEvent::Error { .. } => "error",
            TransportEvent::Unknown { event_type, .. } => event_type,
        }
    }
}

/// Kind of a structured history item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryItemType {
    #[default]
    Message,
    FunctionCall,
}

/// One entry of the agent engine's conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub item_id: String,

    #[serde(rename = "type", default)]
    pub item_type: HistoryItemType,

    #[serde(default)]
    pub role: Option<Role>,

    /// Flattened text content
    #[serde(default)]
    pub content: Option<String>,

    /// Function name, for function calls
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub arguments: Option<Value>,

    #[serde(default)]
    pub created_at_ms: Option<u64>,

    #[serde(default)]
    pub status: Option<ItemStatus>,
}

impl HistoryItem {
    pub fn message(item_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            item_type: HistoryItemType::Message,
            role: Some(role),
            content: Some(content.into()),
            name: None,
            arguments: None,
            created_at_ms: None,
            status: None,
        }
    }

    pub fn function_call(item_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            item_type: HistoryItemType::FunctionCall,
            role: None,
            content: None,
            name: Some(name.into()),
            arguments: None,
            created_at_ms: None,
            status: None,
        }
    }

    pub fn at(mut self, created_at_ms: u64) -> Self {
        self.created_at_ms = Some(created_at_ms);
        self
    }
}

// ============================================================================
// Outbound events (session -> transport)
// ============================================================================

/// Session parameters sent with the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSetup {
    pub session_id: String,
    pub codec: AudioCodec,
    pub input_audio_format: String,
    pub agents: Vec<AgentConfig>,
    /// Names of the output guardrails applied by this side
    pub output_guardrails: Vec<String>,
}

/// Message content part of a conversation item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub role: Role,
    pub content: Vec<ContentPart>,
}

/// Command sent to the realtime transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSetup },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate,

    #[serde(rename = "response.cancel")]
    ResponseCancel,

    /// Base64-encoded PCM16 audio
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    /// Pre-built JSON forwarded untouched
    #[serde(skip)]
    Raw(Value),
}

impl ClientEvent {
    /// A user text message with a fresh item id
    pub fn user_text(text: impl Into<String>) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem {
                id: uuid::Uuid::new_v4().simple().to_string(),
                item_type: "message".to_string(),
                role: Role::User,
                content: vec![ContentPart {
                    part_type: "input_text".to_string(),
                    text: text.into(),
                }],
            },
        }
    }

    /// Append microphone audio (PCM16 samples) to the input buffer
    pub fn append_audio(samples: &[i16]) -> Self {
        use base64::Engine;

        let pcm_bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        ClientEvent::InputAudioBufferAppend {
            audio: base64::engine::general_purpose::STANDARD.encode(pcm_bytes),
        }
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            ClientEvent::Raw(value) => Ok(value.clone()),
            other => serde_json::to_value(other),
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::ResponseCreate => "response.create",
            ClientEvent::ResponseCancel => "response.cancel",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit => "input_audio_buffer.commit",
            ClientEvent::InputAudioBufferClear => "input_audio_buffer.clear",
            ClientEvent::Raw(value) => value
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("<raw>"),
        }
    }
}
