//! In-memory test doubles for the coordinator's capabilities.
//!
//! `MemoryConversationStore` and `ScriptedAgent` stand in for the real
//! SQLite store and agent backend in unit tests: no database, no network,
//! fully deterministic. They live in a public module so downstream crates
//! can reuse them in their own tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use futures_util::stream;
use uuid::Uuid;

use parley_types::agent::{AgentEvent, AgentInvocation, AgentReply};
use parley_types::conversation::{
    Conversation, ConversationRef, ConversationStatus, MessageRole, NewMessage, PersistedMessage,
};
use parley_types::error::{AgentError, StoreError};
use parley_types::turn::TokenUsage;

use crate::agent::{AgentEventStream, AgentPort};
use crate::store::ConversationStore;

// ---------------------------------------------------------------------------
// MemoryConversationStore
// ---------------------------------------------------------------------------

/// In-memory `ConversationStore` backed by mutex-guarded maps.
///
/// `set_fail_assistant_appends(true)` makes appends of assistant messages
/// fail with a query error, for exercising partial-write error paths.
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: Mutex<HashMap<Uuid, Conversation>>,
    messages: Mutex<Vec<PersistedMessage>>,
    fail_assistant_appends: AtomicBool,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a conversation directly, bypassing `create`.
    pub fn seed_conversation(&self, user_id: Uuid, org_id: Uuid, title: &str) -> Conversation {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::now_v7(),
            user_id,
            org_id,
            title: title.to_string(),
            context: serde_json::json!({}),
            metadata: serde_json::json!({}),
            status: ConversationStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.conversations
            .lock()
            .unwrap()
            .insert(conversation.id, conversation.clone());
        conversation
    }

    /// All messages stored for a conversation, in insertion order.
    pub fn messages_for(&self, conversation_id: &Uuid) -> Vec<PersistedMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.conversation_id == *conversation_id)
            .cloned()
            .collect()
    }

    /// Total number of stored messages across all conversations.
    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    /// Look up a conversation without tenancy scoping (test inspection only).
    pub fn conversation(&self, conversation_id: &Uuid) -> Option<Conversation> {
        self.conversations.lock().unwrap().get(conversation_id).cloned()
    }

    /// Make future assistant-message appends fail.
    pub fn set_fail_assistant_appends(&self, fail: bool) {
        self.fail_assistant_appends.store(fail, Ordering::SeqCst);
    }
}

impl ConversationStore for MemoryConversationStore {
    async fn find_owned(
        &self,
        conversation: &ConversationRef,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self
            .conversations
            .lock()
            .unwrap()
            .get(&conversation.conversation_id)
            .filter(|c| c.user_id == conversation.user_id && c.org_id == conversation.org_id)
            .cloned())
    }

    async fn create(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        title: String,
        context: serde_json::Value,
        metadata: serde_json::Value,
    ) -> Result<Conversation, StoreError> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::now_v7(),
            user_id,
            org_id,
            title,
            context,
            metadata,
            status: ConversationStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.conversations
            .lock()
            .unwrap()
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn append_message(&self, message: &NewMessage) -> Result<PersistedMessage, StoreError> {
        if message.role == MessageRole::Assistant
            && self.fail_assistant_appends.load(Ordering::SeqCst)
        {
            return Err(StoreError::Query("simulated append failure".to_string()));
        }

        let persisted = PersistedMessage {
            id: Uuid::now_v7(),
            conversation_id: message.conversation_id,
            user_id: message.user_id,
            role: message.role,
            content: message.content.clone(),
            metadata: message.metadata.clone(),
            created_at: Utc::now(),
        };
        self.messages.lock().unwrap().push(persisted.clone());

        if let Some(conversation) = self
            .conversations
            .lock()
            .unwrap()
            .get_mut(&message.conversation_id)
        {
            conversation.updated_at = persisted.created_at;
        }

        Ok(persisted)
    }

    async fn update_title(&self, conversation_id: &Uuid, title: String) -> Result<(), StoreError> {
        match self.conversations.lock().unwrap().get_mut(conversation_id) {
            Some(conversation) => {
                conversation.title = title;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn list_for_user(
        &self,
        user_id: &Uuid,
        org_id: &Uuid,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Conversation>, StoreError> {
        let mut conversations: Vec<Conversation> = self
            .conversations
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.user_id == *user_id && c.org_id == *org_id)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let offset = offset.unwrap_or(0).max(0) as usize;
        let limit = limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
        Ok(conversations.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_messages(
        &self,
        conversation_id: &Uuid,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<PersistedMessage>, StoreError> {
        let messages = self.messages_for(conversation_id);
        let offset = offset.unwrap_or(0).max(0) as usize;
        let limit = limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
        Ok(messages.into_iter().skip(offset).take(limit).collect())
    }

    async fn close(&self, conversation_id: &Uuid) -> Result<(), StoreError> {
        match self.conversations.lock().unwrap().get_mut(conversation_id) {
            Some(conversation) => {
                conversation.status = ConversationStatus::Closed;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedAgent
// ---------------------------------------------------------------------------

/// Behavior of [`ScriptedAgent::invoke`].
pub enum InvokeScript {
    Reply { content: String, usage: TokenUsage },
    Fail(String),
    /// Never resolves; for cancellation tests.
    Hang,
}

/// One scripted streaming event. `Hang` makes the stream pend forever at
/// that position.
#[derive(Clone)]
pub enum ScriptedEvent {
    Delta(String),
    Usage(TokenUsage),
    Done,
    Error(String),
    Hang,
}

/// Agent double that replays a script instead of calling a model.
pub struct ScriptedAgent {
    invoke_script: InvokeScript,
    events: Vec<ScriptedEvent>,
}

impl ScriptedAgent {
    /// A sync agent that replies with fixed content.
    pub fn replying(content: &str) -> Self {
        Self {
            invoke_script: InvokeScript::Reply {
                content: content.to_string(),
                usage: TokenUsage {
                    input_tokens: 12,
                    output_tokens: 34,
                },
            },
            events: Vec::new(),
        }
    }

    /// A sync agent whose invocation fails.
    pub fn failing(message: &str) -> Self {
        Self {
            invoke_script: InvokeScript::Fail(message.to_string()),
            events: Vec::new(),
        }
    }

    /// An agent whose invocation never completes.
    pub fn hanging() -> Self {
        Self {
            invoke_script: InvokeScript::Hang,
            events: vec![ScriptedEvent::Hang],
        }
    }

    /// A streaming agent that replays the given events.
    pub fn streaming(events: Vec<ScriptedEvent>) -> Self {
        Self {
            invoke_script: InvokeScript::Fail("streaming-only double".to_string()),
            events,
        }
    }
}

impl AgentPort for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, _invocation: &AgentInvocation) -> Result<AgentReply, AgentError> {
        match &self.invoke_script {
            InvokeScript::Reply { content, usage } => Ok(AgentReply {
                content: content.clone(),
                usage: *usage,
                model: "scripted-model".to_string(),
            }),
            InvokeScript::Fail(message) => Err(AgentError::Provider {
                message: message.clone(),
            }),
            InvokeScript::Hang => std::future::pending().await,
        }
    }

    fn invoke_streaming(&self, _invocation: AgentInvocation) -> AgentEventStream {
        let events = self.events.clone();
        Box::pin(stream::unfold(events.into_iter(), |mut events| async move {
            match events.next() {
                None => None,
                Some(ScriptedEvent::Hang) => std::future::pending().await,
                Some(ScriptedEvent::Delta(text)) => {
                    Some((Ok(AgentEvent::TextDelta { text }), events))
                }
                Some(ScriptedEvent::Usage(usage)) => Some((Ok(AgentEvent::Usage(usage)), events)),
                Some(ScriptedEvent::Done) => Some((Ok(AgentEvent::Done), events)),
                Some(ScriptedEvent::Error(message)) => {
                    Some((Err(AgentError::Stream(message)), events))
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_memory_store_tenancy_scoping() {
        let store = MemoryConversationStore::new();
        let owner = Uuid::now_v7();
        let org = Uuid::now_v7();
        let conversation = store.seed_conversation(owner, org, "seeded");

        let found = store.find_owned(&conversation.conversation_ref()).await.unwrap();
        assert!(found.is_some());

        let stranger = Uuid::now_v7();
        let found = store
            .find_owned(&ConversationRef {
                conversation_id: conversation.id,
                user_id: stranger,
                org_id: org,
            })
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_scripted_agent_stream_replay() {
        let agent = ScriptedAgent::streaming(vec![
            ScriptedEvent::Delta("a".to_string()),
            ScriptedEvent::Error("boom".to_string()),
        ]);
        let invocation = AgentInvocation {
            conversation_id: Uuid::now_v7(),
            message: "hi".to_string(),
            history: Vec::new(),
            kind: parley_types::turn::AgentKind::Master,
            model: "m".to_string(),
            temperature: 0.7,
            max_output_tokens: 100,
            context: serde_json::json!({}),
        };

        let mut stream = agent.invoke_streaming(invocation);
        assert!(matches!(
            stream.next().await,
            Some(Ok(AgentEvent::TextDelta { .. }))
        ));
        assert!(matches!(stream.next().await, Some(Err(AgentError::Stream(_)))));
        assert!(stream.next().await.is_none());
    }
}
