//! Crate-wide error taxonomy (spec §7).
//!
//! Mirrors the teacher's `llm::provider::ProviderError` in shape (a
//! `thiserror` enum with one variant per failure kind) but widened to the
//! engine's own taxonomy. `ProviderError` stays the adapter-level error and
//! converts into `GatewayError` at the orchestrator boundary via `#[from]`.

use crate::adapter::ProviderError;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("sequence mismatch: expected {expected}, got {actual}")]
    SeqMismatch { expected: u64, actual: u64 },

    #[error("message is not the last message in the conversation")]
    NotLastMessage,

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("upstream error: {0}")]
    UpstreamError(#[from] ProviderError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("turn aborted")]
    Abort,

    #[error("internal error: {0}")]
    Internal(String),
}

/// The stable wire error code (spec §6 `{ error, message, error_code?, details? }`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequestError,
    InvalidIntent,
    ConversationNotFound,
    SeqMismatch,
    NotLastMessage,
    LimitExceeded,
    UpstreamError,
    Internal,
}

impl GatewayError {
    /// HTTP status this error should be rendered with (spec §6).
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::InvalidConfig(_) => 400,
            GatewayError::ConversationNotFound(_) => 404,
            GatewayError::SeqMismatch { .. } | GatewayError::NotLastMessage => 409,
            GatewayError::LimitExceeded(_) => 429,
            GatewayError::UpstreamError(_) | GatewayError::Internal(_) | GatewayError::Abort => {
                500
            }
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::InvalidConfig(_) => {
                ErrorCode::InvalidRequestError
            }
            GatewayError::ConversationNotFound(_) => ErrorCode::ConversationNotFound,
            GatewayError::SeqMismatch { .. } => ErrorCode::SeqMismatch,
            GatewayError::NotLastMessage => ErrorCode::NotLastMessage,
            GatewayError::LimitExceeded(_) => ErrorCode::LimitExceeded,
            GatewayError::UpstreamError(_) => ErrorCode::UpstreamError,
            GatewayError::Internal(_) | GatewayError::Abort => ErrorCode::Internal,
        }
    }

    /// The JSON body shape of spec §6.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: self.error_code(),
            message: self.to_string(),
            error_code: Some(self.error_code()),
            details: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Soft, per-tool-call failure kinds (spec §7): never fatal to the turn,
/// always surfaced as a `tool_output` with `status=error`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolCallError {
    #[error("unknown_tool:{0}")]
    UnknownTool(String),
    #[error("invalid_arguments_json")]
    InvalidArgumentsJson,
    #[error("invalid_args: {0}")]
    InvalidArgs(String),
    #[error("tool_failure: {0}")]
    ToolFailure(String),
}

impl ToolCallError {
    /// The human-readable string handed back as the tool_output payload.
    pub fn as_output(&self) -> String {
        self.to_string()
    }
}
