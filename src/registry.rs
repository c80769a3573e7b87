//! Tool registry (C4) — spec §4.4/§4.7.
//!
//! Grounded on `llm/registry.rs::ToolRegistry`, reworked around the
//! validate/invoke split of [`crate::tools::ToolProvider`]: the teacher's
//! registry only ever `execute`s a call; this one lets the orchestrator
//! validate a freshly-assembled call before committing to running it.

use crate::error::ToolCallError;
use crate::tools::ToolProvider;
use crate::types::{ToolCall, ToolOutput};
use std::collections::HashMap;
use std::sync::Arc;

/// One entry of the provider-visible toolset spec (spec §4.2 `toolsetSpec`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Name-keyed table of available tools.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolProvider>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every built-in tool (spec §1: demo `bash` only).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for tool in crate::tools::all_tools() {
            registry.register_provider(tool);
        }
        registry
    }

    pub fn register<T: ToolProvider + 'static>(&mut self, tool: T) {
        self.register_provider(Arc::new(tool));
    }

    pub fn register_provider(&mut self, tool: Arc<dyn ToolProvider>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolProvider>> {
        self.tools.get(name).cloned()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Toolset spec for the subset of names the conversation has active
    /// (spec §4.5: unknown/inactive names are simply omitted, not errors).
    pub fn specs_for(&self, names: &[String]) -> Vec<ToolSpec> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// Validate one call's arguments against its tool's schema without
    /// running anything. Spec §4.7: unknown tool name and invalid
    /// arguments JSON are both soft failures, never turn-fatal.
    pub fn validate(&self, call: &ToolCall) -> Result<(), ToolCallError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolCallError::UnknownTool(call.name.clone()))?;
        tool.validate(&call.arguments)
    }

    /// Validate then execute one call, always returning a [`ToolOutput`]
    /// rather than propagating failure — per spec §4.7, a tool failure is
    /// reported as `status=error` output, never aborts the turn.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.validate(call) {
            Ok(()) => {}
            Err(e) => return ToolOutput::error(call.id.clone(), e.as_output()),
        }
        let tool = match self.tools.get(&call.name) {
            Some(t) => t,
            None => {
                return ToolOutput::error(
                    call.id.clone(),
                    ToolCallError::UnknownTool(call.name.clone()).as_output(),
                )
            }
        };
        match tool.invoke(&call.arguments).await {
            Ok(output) => ToolOutput::success(call.id.clone(), output),
            Err(e) => ToolOutput::error(call.id.clone(), e.as_output()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::bash::BashTool;

    #[test]
    fn with_builtins_registers_bash() {
        let registry = ToolRegistry::with_builtins();
        assert!(registry.has_tool("bash"));
    }

    #[tokio::test]
    async fn execute_unknown_tool_returns_error_output_not_panic() {
        let registry = ToolRegistry::new();
        let call = ToolCall {
            id: "1".to_string(),
            name: "does_not_exist".to_string(),
            arguments: "{}".to_string(),
        };
        let out = registry.execute(&call).await;
        assert!(out.is_error());
    }

    #[tokio::test]
    async fn execute_invalid_arguments_returns_error_output() {
        let mut registry = ToolRegistry::new();
        registry.register(BashTool::new());
        let call = ToolCall {
            id: "1".to_string(),
            name: "bash".to_string(),
            arguments: "not json".to_string(),
        };
        let out = registry.execute(&call).await;
        assert!(out.is_error());
    }

    #[tokio::test]
    async fn execute_valid_bash_call_succeeds() {
        let mut registry = ToolRegistry::new();
        registry.register(BashTool::new());
        let call = ToolCall {
            id: "1".to_string(),
            name: "bash".to_string(),
            arguments: "{\"command\":\"echo hi\"}".to_string(),
        };
        let out = registry.execute(&call).await;
        assert!(!out.is_error());
        assert!(out.output.contains("hi"));
    }

    #[test]
    fn specs_for_omits_unknown_names() {
        let registry = ToolRegistry::with_builtins();
        let specs = registry.specs_for(&["bash".to_string(), "ghost".to_string()]);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "bash");
    }
}
