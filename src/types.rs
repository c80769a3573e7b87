//! Core domain types shared by every component of the engine.
//!
//! These are the "design terms" of spec.md §3 made concrete: `Conversation`,
//! `Message`, `ToolCall`, `ToolOutput`, and the internal `StreamEvent` union
//! the orchestrator hands to the stream multiplexer. Nothing here owns I/O;
//! ownership of durable state lives behind the `Persistence` port
//! ([`crate::persistence`]).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single part of a structured message body.
///
/// Plain messages use [`Content::Text`]; once an image reference or a
/// prompt-cache marker is attached the content is promoted to
/// [`Content::Parts`] (see [`crate::cache`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheMarker>,
    },
    Image {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
}

/// An `ephemeral` prompt-cache annotation (C10).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheMarker {
    #[serde(rename = "type")]
    pub marker_type: String,
}

impl CacheMarker {
    pub fn ephemeral() -> Self {
        Self {
            marker_type: "ephemeral".to_string(),
        }
    }
}

/// Message content: either a plain string, or an ordered sequence of typed
/// parts (text / image / cache marker).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    pub fn as_text(&self) -> String {
        match self {
            Content::Text(t) => t.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text, .. } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_text().is_empty()
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

/// A structured tool call, either mid-assembly (see [`crate::assembler`]) or
/// whole. `arguments` is opaque JSON text — the orchestrator never parses
/// it; only the adapter (for re-serialisation) and the tool registry's
/// validator do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Execution status of a [`ToolOutput`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutputStatus {
    Success,
    Error,
}

/// The result of locally executing one [`ToolCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
    pub status: ToolOutputStatus,
}

impl ToolOutput {
    pub fn success(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            output: output.into(),
            status: ToolOutputStatus::Success,
        }
    }

    pub fn error(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            output: output.into(),
            status: ToolOutputStatus::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, ToolOutputStatus::Error)
    }
}

/// Reason generation stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Cancelled,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Cancelled => "cancelled",
        }
    }
}

/// Whether a persisted message represents a completed turn or an error
/// marker (spec §7: "exactly one of {final, error marker} is committed").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Final,
    Error,
}

/// A durable message. `seq` is a monotone 1-based counter within a
/// conversation (spec §3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub seq: u64,
    pub role: Role,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_outputs: Option<Vec<ToolOutput>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u32>,
}

/// Token usage, carried over from the teacher's `TokenUsage`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
    }
}

/// Sticky per-conversation settings the client (or a prior turn) selected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_id: Option<String>,
    #[serde(default)]
    pub active_tool_names: Vec<String>,
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default)]
    pub tools_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A conversation: the durable parent of a sequence of [`Message`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub model: String,
    pub provider_id: String,
    #[serde(default)]
    pub settings: ConversationSettings,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub next_seq: u64,
}

/// The internal event union the orchestrator emits to the stream
/// multiplexer (C8). These are *not* the wire frames — [`crate::stream`]
/// renders each of these into the SSE chunk shape of spec §6.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    ContentDelta(String),
    ReasoningDelta(String),
    /// A whole tool call, emitted only at iteration end (C5 invariant).
    ToolCalls(Vec<ToolCall>),
    ToolOutput {
        tool_call_id: String,
        name: String,
        output: String,
        status: ToolOutputStatus,
    },
    /// Out-of-band conversation metadata frame (at most one per turn).
    ConversationMetadata(ConversationMetadataFrame),
    /// Final chunk: empty delta plus a finish reason.
    FinalChunk { finish_reason: FinishReason },
    /// A non-fatal parse/translation problem surfaced as assistant content.
    Error(String),
}

/// The `_conversation` out-of-band frame (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMetadataFrame {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub model: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub tools_enabled: bool,
    pub active_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_system_prompt_id: Option<String>,
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_message_id: Option<String>,
}

/// Extra, provider-specific knobs that don't fit the common request shape.
pub type ExtraOptions = HashMap<String, serde_json::Value>;
