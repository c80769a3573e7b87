//! Conversation builder (C6) — spec §4.5.
//!
//! Grounded on `llm/openai.rs`'s `prune_tool_turns`/
//! `convert_to_responses_input` history-shaping patterns, regeneralized
//! into an adapter-agnostic step: decide once, up front, whether this turn
//! can ride the `previous_response_id` optimisation or needs the full
//! rehydrated history, before any adapter ever sees a message list.

use crate::adapter::Adapter;
use crate::persistence::{Persistence, PersistenceError};
use crate::types::{Content, Message, MessageStatus, Role};

/// The message list an adapter should translate, plus whether it was built
/// from `previous_response_id` (so [`crate::orchestrator`] knows to retry
/// with a full rebuild if the upstream rejects the id).
pub struct BuiltTurn {
    pub messages: Vec<Message>,
    pub previous_response_id: Option<String>,
}

/// Build the message list for the next upstream call.
///
/// Order of rules (spec §4.5):
/// 1. Strip any `Role::System` messages from the caller-supplied list —
///    the system prompt is resolved and prepended separately.
/// 2. If persistence holds a conversation, the adapter supports
///    `previous_response_id`, and the last final assistant message has one,
///    send only the new user-turn messages plus the resolved system
///    prompt, with `previous_response_id` attached.
/// 3. Otherwise rehydrate up to `message_window` messages of ordered
///    history, re-materialising each assistant `tool_calls` message
///    followed by its `tool_outputs` as `Role::Tool` follow-ups.
/// 4. If persistence is absent entirely, use the caller-supplied list
///    as-is (minus system messages).
/// 5. Always prepend the resolved system prompt as a single
///    `Role::System` message.
pub async fn build_turn(
    adapter: &dyn Adapter,
    persistence: Option<&dyn Persistence>,
    conversation_id: &str,
    system_prompt: Option<&str>,
    new_messages: &[Message],
    message_window: usize,
) -> Result<BuiltTurn, PersistenceError> {
    let new_non_system: Vec<Message> = new_messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();

    let mut previous_response_id = None;
    let mut messages;

    match persistence {
        Some(store) if adapter.supports_previous_response_id() => {
            let last_id = store
                .get_last_assistant_response_id(conversation_id)
                .await?;
            if let Some(id) = last_id {
                previous_response_id = Some(id);
                messages = new_non_system;
            } else {
                messages = rehydrate(store, conversation_id, message_window, &new_non_system).await?;
            }
        }
        Some(store) => {
            messages = rehydrate(store, conversation_id, message_window, &new_non_system).await?;
        }
        None => {
            messages = new_non_system;
        }
    }

    if let Some(prompt) = system_prompt {
        messages.insert(0, system_message(conversation_id, prompt));
    }

    Ok(BuiltTurn {
        messages,
        previous_response_id,
    })
}

/// Build the fallback full-history turn after upstream rejects
/// `previous_response_id` as stale/invalid (spec §4.5 retry rule:
/// rebuild-and-retry exactly once).
pub async fn rebuild_without_previous_response_id(
    persistence: &dyn Persistence,
    conversation_id: &str,
    system_prompt: Option<&str>,
    new_messages: &[Message],
    message_window: usize,
) -> Result<BuiltTurn, PersistenceError> {
    let new_non_system: Vec<Message> = new_messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();
    let mut messages =
        rehydrate(persistence, conversation_id, message_window, &new_non_system).await?;
    if let Some(prompt) = system_prompt {
        messages.insert(0, system_message(conversation_id, prompt));
    }
    Ok(BuiltTurn {
        messages,
        previous_response_id: None,
    })
}

async fn rehydrate(
    persistence: &dyn Persistence,
    conversation_id: &str,
    message_window: usize,
    new_messages: &[Message],
) -> Result<Vec<Message>, PersistenceError> {
    let history = persistence
        .get_history(conversation_id, message_window)
        .await?;

    let mut out = Vec::with_capacity(history.len() + new_messages.len());
    for message in history {
        if message.status == MessageStatus::Error {
            // Error markers are never replayed back upstream (spec §4.9:
            // exactly one of {final, error marker} is committed per turn,
            // and an error marker ends that turn's contribution to history).
            continue;
        }
        let has_tool_calls = message.tool_calls.as_ref().map(|c| !c.is_empty()).unwrap_or(false);
        let tool_outputs = message.tool_outputs.clone();
        out.push(message);
        if has_tool_calls {
            if let Some(outputs) = tool_outputs {
                for output in outputs {
                    out.push(Message {
                        id: uuid::Uuid::new_v4().to_string(),
                        conversation_id: conversation_id.to_string(),
                        seq: 0,
                        role: Role::Tool,
                        content: Content::Text(output.output.clone()),
                        tool_call_id: Some(output.tool_call_id.clone()),
                        tool_calls: None,
                        tool_outputs: None,
                        finish_reason: None,
                        status: MessageStatus::Final,
                        response_id: None,
                        reasoning_details: None,
                        reasoning_tokens: None,
                    });
                }
            }
        }
    }
    out.extend(new_messages.iter().cloned());
    Ok(out)
}

fn system_message(conversation_id: &str, prompt: &str) -> Message {
    Message {
        id: uuid::Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        seq: 0,
        role: Role::System,
        content: Content::Text(prompt.to_string()),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::openai::OpenAiAdapter;
    use crate::persistence::InMemoryPersistence;
    use crate::types::{ConversationSettings, ToolCall, ToolOutput};

    fn user_message(conversation_id: &str, seq: u64, text: &str) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            seq,
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

    #[tokio::test]
    async fn strips_caller_supplied_system_messages() {
        let adapter = OpenAiAdapter::new();
        let system_and_user = vec![
            Message {
                role: Role::System,
                ..user_message("c1", 1, "ignored system")
            },
            user_message("c1", 2, "hello"),
        ];
        let built = build_turn(&adapter, None, "c1", Some("real prompt"), &system_and_user, 200)
            .await
            .unwrap();
        let system_texts: Vec<_> = built
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_text())
            .collect();
        assert_eq!(system_texts, vec!["real prompt"]);
    }

    #[tokio::test]
    async fn rehydrates_tool_calls_followed_by_tool_outputs() {
        let adapter = OpenAiAdapter::new();
        let persistence = InMemoryPersistence::new();
        persistence
            .resolve_or_create_conversation("u1", Some("c1"), "gpt-4o", "openai", ConversationSettings::default())
            .await
            .unwrap();

        let mut assistant_with_call = user_message("c1", 1, "");
        assistant_with_call.role = Role::Assistant;
        assistant_with_call.tool_calls = Some(vec![ToolCall {
            id: "call_1".to_string(),
            name: "bash".to_string(),
            arguments: "{}".to_string(),
        }]);
        assistant_with_call.tool_outputs = Some(vec![ToolOutput::success("call_1", "ok")]);

        persistence
            .sync_message_history("c1", &[assistant_with_call])
            .await
            .unwrap();

        let new_messages = vec![user_message("c1", 2, "next")];
        let built = build_turn(&adapter, Some(&persistence), "c1", None, &new_messages, 200)
            .await
            .unwrap();

        let roles: Vec<_> = built.messages.iter().map(|m| m.role).collect();
        assert!(roles.contains(&Role::Tool), "expected a synthesised tool message: {roles:?}");
    }

    #[tokio::test]
    async fn no_persistence_uses_caller_list_as_is() {
        let adapter = OpenAiAdapter::new();
        let new_messages = vec![user_message("c1", 1, "hi")];
        let built = build_turn(&adapter, None, "c1", None, &new_messages, 200)
            .await
            .unwrap();
        assert_eq!(built.messages.len(), 1);
        assert!(built.previous_response_id.is_none());
    }
}
