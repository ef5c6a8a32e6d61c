//! Conversation and message types for the Parley gateway.
//!
//! A conversation is owned by exactly one (user, organization) pair. Every
//! message references its conversation; assistant messages carry no owning
//! user id. Tenancy is part of identity, not a filter applied after the fact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Tenant-scoped identity of a conversation.
///
/// Carries the owning user and organization alongside the conversation id so
/// ownership checks can never be skipped by accident: any lookup through a
/// `ConversationRef` is scoped to the requester's tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRef {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub org_id: Uuid,
}

/// Lifecycle status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Closed,
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationStatus::Active => write!(f, "active"),
            ConversationStatus::Closed => write!(f, "closed"),
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(ConversationStatus::Active),
            "closed" => Ok(ConversationStatus::Closed),
            other => Err(format!("invalid conversation status: '{other}'")),
        }
    }
}

/// A persisted conversation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub org_id: Uuid,
    /// Empty until the first turn derives a title from the user's message.
    pub title: String,
    /// Free-form context carried across turns (client-supplied).
    pub context: serde_json::Value,
    /// Server-side metadata (invocation source, flags).
    pub metadata: serde_json::Value,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Borrow this conversation's tenant-scoped identity.
    pub fn conversation_ref(&self) -> ConversationRef {
        ConversationRef {
            conversation_id: self.id,
            user_id: self.user_id,
            org_id: self.org_id,
        }
    }
}

/// Role of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(format!("invalid message role: '{other}'")),
        }
    }
}

/// A message as stored by the `ConversationStore`.
///
/// Created exactly once per human message and exactly once per assembled
/// assistant response — never partially, never duplicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// Owning user; `None` for assistant and system messages.
    pub user_id: Option<Uuid>,
    pub role: MessageRole,
    pub content: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// The insert shape for a new message (id and timestamp assigned by the store).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub user_id: Option<Uuid>,
    pub role: MessageRole,
    pub content: String,
    pub metadata: serde_json::Value,
}
