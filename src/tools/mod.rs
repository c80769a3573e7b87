//! `ToolProvider` trait (C4) and the built-in demo tool set.
//!
//! The teacher's `registry.rs` already calls `crate::tools::ToolProvider`
//! and `crate::tools::all_tools()`, but neither was ever defined anywhere in
//! the teacher repo — grepping the pristine copy confirms the gap predates
//! this rework. Defined here with the validate/invoke split spec §4.7
//! requires (the teacher's tools only exposed a single `execute`).

pub mod bash;

use crate::error::ToolCallError;
use async_trait::async_trait;

/// A tool the registry can expose to an adapter and later invoke.
///
/// `validate` and `invoke` are split per spec §4.7: the orchestrator
/// validates a freshly-assembled call's arguments against the schema
/// before ever executing it, so a malformed call can be reported as a
/// `tool_output` with `status=error` without side effects.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Stable name the model sees and the registry keys on.
    fn name(&self) -> &str;

    /// Human-readable description surfaced in the toolset spec (spec §4.2
    /// `toolsetSpec`).
    fn description(&self) -> String;

    /// JSON Schema for `arguments`.
    fn parameters(&self) -> serde_json::Value;

    /// Parse and validate a tool call's opaque `arguments` string against
    /// this tool's schema, without executing anything.
    fn validate(&self, arguments: &str) -> Result<(), ToolCallError> {
        if arguments.trim().is_empty() {
            return Ok(());
        }
        serde_json::from_str::<serde_json::Value>(arguments)
            .map(|_| ())
            .map_err(|_| ToolCallError::InvalidArgumentsJson)
    }

    /// Execute the tool and return its output text. Callers are expected
    /// to have called [`Self::validate`] first.
    async fn invoke(&self, arguments: &str) -> Result<String, ToolCallError>;
}

/// The built-in tools available without external configuration — just
/// `bash`, kept from the teacher as a demo tool exercising the registry
/// (spec §1 scopes real tool implementations out of this engine).
pub fn all_tools() -> Vec<std::sync::Arc<dyn ToolProvider>> {
    vec![std::sync::Arc::new(bash::BashTool::new())]
}
