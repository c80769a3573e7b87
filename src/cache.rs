//! Prompt-cache annotator (C10) — spec §4.10.
//!
//! Grounded on `llm/anthropic.rs`'s `CacheControl`/`cache_control` wire
//! types, generalised into an adapter-agnostic annotation step: the
//! teacher only ever set this for Anthropic requests inline in
//! `build_request_body`; here it runs once, before any adapter sees the
//! message list, and is skipped entirely for adapters/models that don't
//! advertise support.

use crate::adapter::Adapter;
use crate::types::{CacheMarker, Content, ContentPart, Message};

/// Attach an `ephemeral` cache marker to the last message, if the adapter
/// advertises prompt-cache support for `model` and caching is enabled in
/// config. Never fails the turn — on any inability to annotate, the
/// original messages are returned unchanged and the caller proceeds as if
/// caching were simply unavailable (spec §4.10).
pub fn annotate(
    adapter: &dyn Adapter,
    model: &str,
    enabled: bool,
    mut messages: Vec<Message>,
) -> Vec<Message> {
    if !enabled || !adapter.supports_prompt_caching(model) {
        return messages;
    }
    let Some(last) = messages.last_mut() else {
        return messages;
    };
    if last.content.is_empty() {
        return messages;
    }
    mark_ephemeral(&mut last.content);
    messages
}

fn mark_ephemeral(content: &mut Content) {
    match content {
        Content::Text(text) => {
            *content = Content::Parts(vec![ContentPart::Text {
                text: std::mem::take(text),
                cache_control: Some(CacheMarker::ephemeral()),
            }]);
        }
        Content::Parts(parts) => {
            if let Some(ContentPart::Text { cache_control, .. }) =
                parts.iter_mut().rev().find(|p| matches!(p, ContentPart::Text { .. }))
            {
                *cache_control = Some(CacheMarker::ephemeral());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::anthropic::AnthropicAdapter;
    use crate::adapter::openai::OpenAiAdapter;
    use crate::types::{MessageStatus, Role};

    fn message(text: &str) -> Message {
        Message {
            id: "1".into(),
            conversation_id: "c1".into(),
            seq: 1,
            role: Role::User,
            content: Content::Text(text.to_string()),
            tool_call_id: None,
            tool_calls: None,
            tool_outputs: None,
            finish_reason: None,
            status: MessageStatus::Final,
            response_id: None,
            reasoning_details: None,
            reasoning_tokens: None,
        }
    }

    #[test]
    fn annotates_last_message_for_supporting_adapter() {
        let adapter = AnthropicAdapter::new();
        let messages = vec![message("a"), message("b")];
        let annotated = annotate(&adapter, "claude-sonnet-4-20250514", true, messages);
        match &annotated.last().unwrap().content {
            Content::Parts(parts) => match &parts[0] {
                ContentPart::Text { cache_control, .. } => assert!(cache_control.is_some()),
                _ => panic!("expected text part"),
            },
            _ => panic!("expected parts content"),
        }
        // Earlier messages are left untouched.
        assert!(matches!(annotated[0].content, Content::Text(_)));
    }

    #[test]
    fn skips_when_disabled() {
        let adapter = AnthropicAdapter::new();
        let messages = vec![message("a")];
        let annotated = annotate(&adapter, "claude-sonnet-4-20250514", false, messages);
        assert!(matches!(annotated[0].content, Content::Text(_)));
    }

    #[test]
    fn skips_for_adapter_without_support() {
        let adapter = OpenAiAdapter::new();
        let messages = vec![message("a")];
        let annotated = annotate(&adapter, "gpt-4o", true, messages);
        assert!(matches!(annotated[0].content, Content::Text(_)));
    }
}
