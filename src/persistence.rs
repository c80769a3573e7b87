//! Persistence port (C9) — spec §4.9.
//!
//! New relative to the teacher: it never persists anything (each provider's
//! `chat_loop` is a one-shot in-process conversation). The trait's method
//! set is lifted directly from spec §4.9; [`InMemoryPersistence`] is the
//! reference implementation used by tests and by default when no durable
//! backing store is configured.

use crate::types::{Conversation, ConversationSettings, Message};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("conversation not found: {0}")]
    NotFound(String),
    #[error("sequence mismatch: expected {expected}, got {actual}")]
    SeqMismatch { expected: u64, actual: u64 },
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable conversation/message storage boundary.
///
/// Every method is safe to call concurrently for distinct conversation ids;
/// [`Self::sync_message_history`] and [`Self::record_assistant_message`]
/// must be atomic per-conversation (spec §4.9 R1).
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Idempotently ensure a session/owner record exists for `owner`.
    async fn ensure_session(&self, owner: &str) -> Result<(), PersistenceError>;

    /// Find or create the conversation identified by `conversation_id`
    /// (or start a fresh one, if `None`, owned by `owner`).
    async fn resolve_or_create_conversation(
        &self,
        owner: &str,
        conversation_id: Option<&str>,
        model: &str,
        provider_id: &str,
        settings: ConversationSettings,
    ) -> Result<Conversation, PersistenceError>;

    /// Per-owner quota/rate check; returns `Err(LimitExceeded)` to reject
    /// the turn outright (spec §4.9, minimal `checkLimits` — no quota
    /// engine beyond this single gate per spec Non-goals).
    async fn check_limits(&self, owner: &str) -> Result<(), PersistenceError>;

    /// Next monotone `seq` for `conversation_id` without reserving it.
    async fn next_seq(&self, conversation_id: &str) -> Result<u64, PersistenceError>;

    /// Diff-based, idempotent history sync: messages are upserted by
    /// `(role, seq)` so replaying the same batch twice is a no-op
    /// (spec §4.9 R1).
    async fn sync_message_history(
        &self,
        conversation_id: &str,
        messages: &[Message],
    ) -> Result<(), PersistenceError>;

    /// Atomically append the finished assistant message for a turn.
    async fn record_assistant_message(&self, message: Message) -> Result<(), PersistenceError>;

    /// Idempotently mark the in-flight assistant message (if any) for
    /// `conversation_id` as a terminal error, instead of a final message
    /// (spec §7: "exactly one of {final, error marker}").
    async fn mark_assistant_error(
        &self,
        conversation_id: &str,
        seq: u64,
        message: &str,
    ) -> Result<(), PersistenceError>;

    /// Persist changes to sticky conversation settings (title, active
    /// tools, system prompt id, ...).
    async fn update_conversation_metadata(
        &self,
        conversation_id: &str,
        settings: ConversationSettings,
    ) -> Result<(), PersistenceError>;

    /// The `response_id` of the most recent final assistant message, used
    /// by the builder's `previous_response_id` optimisation (spec §4.5).
    async fn get_last_assistant_response_id(
        &self,
        conversation_id: &str,
    ) -> Result<Option<String>, PersistenceError>;

    /// Ordered message history for `conversation_id`, most recent
    /// `limit` messages (spec §4.5's `messageWindow`).
    async fn get_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, PersistenceError>;
}

struct ConversationRecord {
    conversation: Conversation,
    messages: Vec<Message>,
    error_seqs: std::collections::HashSet<u64>,
}

/// In-memory reference implementation. Not crash-durable; intended for
/// tests and as a zero-configuration default (spec Non-goals: no SQL
/// schema is specified).
#[derive(Clone)]
pub struct InMemoryPersistence {
    conversations: Arc<Mutex<HashMap<String, ConversationRecord>>>,
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self {
            conversations: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn ensure_session(&self, _owner: &str) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn resolve_or_create_conversation(
        &self,
        owner: &str,
        conversation_id: Option<&str>,
        model: &str,
        provider_id: &str,
        settings: ConversationSettings,
    ) -> Result<Conversation, PersistenceError> {
        let mut store = self.conversations.lock().await;

        if let Some(id) = conversation_id {
            if let Some(record) = store.get(id) {
                return Ok(record.conversation.clone());
            }
            let conversation = Conversation {
                id: id.to_string(),
                owner: owner.to_string(),
                title: None,
                model: model.to_string(),
                provider_id: provider_id.to_string(),
                settings,
                created_at: chrono::Utc::now(),
                next_seq: 1,
            };
            store.insert(
                id.to_string(),
                ConversationRecord {
                    conversation: conversation.clone(),
                    messages: Vec::new(),
                    error_seqs: Default::default(),
                },
            );
            return Ok(conversation);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let conversation = Conversation {
            id: id.clone(),
            owner: owner.to_string(),
            title: None,
            model: model.to_string(),
            provider_id: provider_id.to_string(),
            settings,
            created_at: chrono::Utc::now(),
            next_seq: 1,
        };
        store.insert(
            id,
            ConversationRecord {
                conversation: conversation.clone(),
                messages: Vec::new(),
                error_seqs: Default::default(),
            },
        );
        Ok(conversation)
    }

    async fn check_limits(&self, _owner: &str) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn next_seq(&self, conversation_id: &str) -> Result<u64, PersistenceError> {
        let store = self.conversations.lock().await;
        let record = store
            .get(conversation_id)
            .ok_or_else(|| PersistenceError::NotFound(conversation_id.to_string()))?;
        Ok(record.conversation.next_seq)
    }

    async fn sync_message_history(
        &self,
        conversation_id: &str,
        messages: &[Message],
    ) -> Result<(), PersistenceError> {
        let mut store = self.conversations.lock().await;
        let record = store
            .get_mut(conversation_id)
            .ok_or_else(|| PersistenceError::NotFound(conversation_id.to_string()))?;

        for incoming in messages {
            match record
                .messages
                .iter_mut()
                .find(|m| m.role == incoming.role && m.seq == incoming.seq)
            {
                Some(existing) => *existing = incoming.clone(),
                None => record.messages.push(incoming.clone()),
            }
        }
        record.messages.sort_by_key(|m| m.seq);
        let max_seq = record.messages.iter().map(|m| m.seq).max().unwrap_or(0);
        record.conversation.next_seq = max_seq + 1;
        Ok(())
    }

    async fn record_assistant_message(&self, message: Message) -> Result<(), PersistenceError> {
        let mut store = self.conversations.lock().await;
        let record = store
            .get_mut(&message.conversation_id)
            .ok_or_else(|| PersistenceError::NotFound(message.conversation_id.clone()))?;
        record.conversation.next_seq = record.conversation.next_seq.max(message.seq + 1);
        record.messages.push(message);
        Ok(())
    }

    async fn mark_assistant_error(
        &self,
        conversation_id: &str,
        seq: u64,
        message: &str,
    ) -> Result<(), PersistenceError> {
        let mut store = self.conversations.lock().await;
        let record = store
            .get_mut(conversation_id)
            .ok_or_else(|| PersistenceError::NotFound(conversation_id.to_string()))?;

        if !record.error_seqs.insert(seq) {
            // Already marked; idempotent no-op (spec §4.9).
            return Ok(());
        }

        record.messages.push(Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            seq,
            role: crate::types::Role::Assistant,
            content: crate::types::Content::Text(message.to_string()),
            tool_call_id: None,
            tool_calls: None,
            tool_outputs: None,
            finish_reason: None,
            status: crate::types::MessageStatus::Error,
            response_id: None,
            reasoning_details: None,
            reasoning_tokens: None,
        });
        record.conversation.next_seq = record.conversation.next_seq.max(seq + 1);
        Ok(())
    }

    async fn update_conversation_metadata(
        &self,
        conversation_id: &str,
        settings: ConversationSettings,
    ) -> Result<(), PersistenceError> {
        let mut store = self.conversations.lock().await;
        let record = store
            .get_mut(conversation_id)
            .ok_or_else(|| PersistenceError::NotFound(conversation_id.to_string()))?;
        record.conversation.settings = settings;
        Ok(())
    }

    async fn get_last_assistant_response_id(
        &self,
        conversation_id: &str,
    ) -> Result<Option<String>, PersistenceError> {
        let store = self.conversations.lock().await;
        let record = store
            .get(conversation_id)
            .ok_or_else(|| PersistenceError::NotFound(conversation_id.to_string()))?;
        Ok(record
            .messages
            .iter()
            .rev()
            .find(|m| m.role == crate::types::Role::Assistant && m.status == crate::types::MessageStatus::Final)
            .and_then(|m| m.response_id.clone()))
    }

    async fn get_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, PersistenceError> {
        let store = self.conversations.lock().await;
        let record = store
            .get(conversation_id)
            .ok_or_else(|| PersistenceError::NotFound(conversation_id.to_string()))?;
        let len = record.messages.len();
        let start = len.saturating_sub(limit);
        Ok(record.messages[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Content, MessageStatus, Role};

    fn message(conversation_id: &str, seq: u64, role: Role) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            seq,
            role,
            content: Content::Text(format!("seq-{seq}")),
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
    async fn resolve_or_create_is_idempotent_for_known_id() {
        let store = InMemoryPersistence::new();
        let a = store
            .resolve_or_create_conversation("u1", Some("c1"), "gpt-4o", "openai", Default::default())
            .await
            .unwrap();
        let b = store
            .resolve_or_create_conversation("u1", Some("c1"), "gpt-4o", "openai", Default::default())
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn sync_message_history_upserts_by_role_and_seq() {
        let store = InMemoryPersistence::new();
        store
            .resolve_or_create_conversation("u1", Some("c1"), "gpt-4o", "openai", Default::default())
            .await
            .unwrap();

        let msg = message("c1", 1, Role::User);
        store.sync_message_history("c1", &[msg.clone()]).await.unwrap();
        store.sync_message_history("c1", &[msg]).await.unwrap();

        let history = store.get_history("c1", 100).await.unwrap();
        assert_eq!(history.len(), 1, "replaying the same batch must be a no-op");
    }

    #[tokio::test]
    async fn mark_assistant_error_is_idempotent() {
        let store = InMemoryPersistence::new();
        store
            .resolve_or_create_conversation("u1", Some("c1"), "gpt-4o", "openai", Default::default())
            .await
            .unwrap();
        store.mark_assistant_error("c1", 2, "boom").await.unwrap();
        store.mark_assistant_error("c1", 2, "boom").await.unwrap();
        let history = store.get_history("c1", 100).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, MessageStatus::Error);
    }

    #[tokio::test]
    async fn get_last_assistant_response_id_ignores_error_markers() {
        let store = InMemoryPersistence::new();
        store
            .resolve_or_create_conversation("u1", Some("c1"), "gpt-4o", "openai", Default::default())
            .await
            .unwrap();
        let mut final_msg = message("c1", 1, Role::Assistant);
        final_msg.response_id = Some("resp_1".to_string());
        store.record_assistant_message(final_msg).await.unwrap();
        store.mark_assistant_error("c1", 2, "boom").await.unwrap();

        let response_id = store.get_last_assistant_response_id("c1").await.unwrap();
        assert_eq!(response_id.as_deref(), Some("resp_1"));
    }
}
