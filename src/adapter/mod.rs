//! `Adapter` capability-set trait (C2) — spec §4.2.
//!
//! Grounded on `llm::provider::LLMProvider`, narrowed to a pure
//! translation boundary: the teacher's trait owns `chat`/`chat_loop` (it
//! drives its own iteration and spawns its own background task per
//! provider). Here that looping moves to [`crate::orchestrator`]; an
//! `Adapter` only ever translates between the engine's internal shapes and
//! one provider's wire dialect.

pub mod anthropic;
pub mod openai;

use crate::registry::ToolSpec;
use crate::types::{Content, FinishReason, Message, TokenUsage};
use async_trait::async_trait;

/// Adapter-level failure (spec §7's upstream taxonomy). Converts into
/// [`crate::error::GatewayError::UpstreamError`] via `#[from]`.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited{}", .retry_after_secs.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    #[error("model not supported by this adapter: {0}")]
    UnsupportedModel(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed tool call at index {index}: {reason}")]
    MalformedToolCall { index: usize, reason: String },
}

impl ProviderError {
    /// Whether [`crate::http_client`] should retry this failure (spec
    /// §4.3: 429 and 5xx only).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Api { status: 500..=599, .. }
        )
    }
}

/// Everything an adapter needs to build one upstream request.
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolSpec],
    pub stream: bool,
    pub previous_response_id: Option<&'a str>,
    pub reasoning_effort: Option<&'a str>,
    pub verbosity: Option<&'a str>,
    pub extra: &'a crate::types::ExtraOptions,
}

/// A fully materialised (non-streaming) response, used by
/// [`Adapter::translate_response`] and as the terminal state streaming
/// folds into.
#[derive(Debug, Clone)]
pub struct TranslatedResponse {
    pub content: Content,
    pub tool_calls: Vec<crate::types::ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
    pub response_id: Option<String>,
}

/// One decoded unit of a streaming response, prior to tool-call assembly
/// (that happens in [`crate::assembler`], fed by `ToolCallDelta`).
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    ContentDelta(String),
    ReasoningDelta(String),
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: Option<String>,
    },
    Usage(TokenUsage),
    Done {
        finish_reason: FinishReason,
        response_id: Option<String>,
    },
    /// A frame type the adapter recognises as informational noise (e.g.
    /// Anthropic's `ping`) — not an error, simply nothing to emit.
    Ignored,
}

/// Capability set + wire translation for one provider dialect.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn id(&self) -> &'static str;
    fn default_model(&self) -> &'static str;
    fn endpoint_url(&self) -> &str;
    fn auth_headers(&self, api_key: &str) -> Vec<(String, String)>;

    fn supports_tools(&self) -> bool {
        true
    }
    fn supports_reasoning_controls(&self, model: &str) -> bool;
    fn supports_prompt_caching(&self, model: &str) -> bool;
    /// Whether this dialect supports resuming from a server-side response
    /// id (spec §4.5's `previous_response_id` optimisation).
    fn supports_previous_response_id(&self) -> bool {
        false
    }

    fn translate_request(&self, request: &ChatRequest<'_>) -> serde_json::Value;

    fn translate_response(
        &self,
        json: &serde_json::Value,
    ) -> Result<TranslatedResponse, ProviderError>;

    /// Translate one decoded SSE frame (already JSON-parsed by
    /// [`crate::sse`]) into zero or more [`AdapterEvent`]s. `event_name` is
    /// the SSE `event:` line, present for Anthropic-style dialects.
    fn translate_stream_event(
        &self,
        event_name: Option<&str>,
        value: &serde_json::Value,
    ) -> Result<Vec<AdapterEvent>, ProviderError>;
}
