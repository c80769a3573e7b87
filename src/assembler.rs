//! Tool-call assembler (C5) — spec §4.4.
//!
//! Grounded on `llm::provider::ToolCallAssembler`, which keys partial tool
//! calls by `id`. That works for OpenAI, whose first delta for a call
//! always carries the id, but Anthropic's `content_block_start` keys on
//! block `index` and some dialects omit `id` on follow-up deltas entirely.
//! Spec §4.4 settles this by keying assembly on `index` throughout, with
//! `id` adopted from whichever delta first supplies it.

use crate::types::ToolCall;
use std::collections::BTreeMap;

/// One tool call's accumulated state, keyed by its delta `index`.
#[derive(Debug, Clone, Default)]
struct Partial {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Accumulates streamed tool-call deltas for a single iteration.
///
/// Reset (via [`Self::new`]) at the start of every model call; deltas never
/// carry across iterations (spec §4.4).
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    partials: BTreeMap<usize, Partial>,
}

/// A tool call dropped at materialisation because it never received an
/// id or a name (spec §4.4 edge case: "malformed_tool_call").
#[derive(Debug, Clone)]
pub struct MalformedToolCall {
    pub index: usize,
    pub reason: &'static str,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one delta. `id`/`name`, when present, overwrite any prior
    /// value for that index (last-writer-wins); `arguments_delta` is always
    /// concatenated, never replaced.
    pub fn apply_delta(
        &mut self,
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        arguments_delta: Option<&str>,
    ) {
        let partial = self.partials.entry(index).or_default();
        if let Some(id) = id {
            partial.id = Some(id.to_string());
        }
        if let Some(name) = name {
            partial.name = Some(name.to_string());
        }
        if let Some(delta) = arguments_delta {
            partial.arguments.push_str(delta);
        }
    }

    /// True once any delta has been observed this iteration.
    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    /// Materialise whole tool calls in ascending index order, per spec
    /// §4.4: empty/whitespace-only arguments normalise to `"{}"`; calls
    /// missing an id or a name are dropped and reported separately rather
    /// than silently discarded.
    pub fn finish(self) -> (Vec<ToolCall>, Vec<MalformedToolCall>) {
        let mut calls = Vec::new();
        let mut malformed = Vec::new();

        for (index, partial) in self.partials {
            let (Some(id), Some(name)) = (partial.id, partial.name) else {
                malformed.push(MalformedToolCall {
                    index,
                    reason: "missing id or name",
                });
                continue;
            };
            let arguments = if partial.arguments.trim().is_empty() {
                "{}".to_string()
            } else {
                partial.arguments
            };
            calls.push(ToolCall {
                id,
                name,
                arguments,
            });
        }

        (calls, malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_single_call_from_interleaved_deltas() {
        let mut asm = ToolCallAssembler::new();
        asm.apply_delta(0, Some("call_1"), Some("bash"), None);
        asm.apply_delta(0, None, None, Some("{\"cmd\":"));
        asm.apply_delta(0, None, None, Some("\"ls\"}"));
        let (calls, malformed) = asm.finish();
        assert!(malformed.is_empty());
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "bash");
        assert_eq!(calls[0].arguments, "{\"cmd\":\"ls\"}");
    }

    #[test]
    fn preserves_index_order_across_parallel_calls() {
        let mut asm = ToolCallAssembler::new();
        asm.apply_delta(1, Some("call_b"), Some("second"), Some("{}"));
        asm.apply_delta(0, Some("call_a"), Some("first"), Some("{}"));
        let (calls, _) = asm.finish();
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[1].name, "second");
    }

    #[test]
    fn normalises_empty_arguments_to_empty_object() {
        let mut asm = ToolCallAssembler::new();
        asm.apply_delta(0, Some("call_1"), Some("noop"), None);
        let (calls, _) = asm.finish();
        assert_eq!(calls[0].arguments, "{}");
    }

    #[test]
    fn drops_call_missing_name_as_malformed() {
        let mut asm = ToolCallAssembler::new();
        asm.apply_delta(0, Some("call_1"), None, Some("{}"));
        let (calls, malformed) = asm.finish();
        assert!(calls.is_empty());
        assert_eq!(malformed.len(), 1);
        assert_eq!(malformed[0].index, 0);
    }

    #[test]
    fn last_writer_wins_for_name_on_duplicate_delta() {
        let mut asm = ToolCallAssembler::new();
        asm.apply_delta(0, Some("call_1"), Some("first_name"), None);
        asm.apply_delta(0, None, Some("second_name"), None);
        let (calls, _) = asm.finish();
        assert_eq!(calls[0].name, "second_name");
    }
}
