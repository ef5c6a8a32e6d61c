//! ConversationStore trait definition.
//!
//! The persistence capability consumed by the turn coordinator. Uses native
//! async fn in traits (RPITIT, Rust 2024 edition); implementations live in
//! parley-infra (e.g., `SqliteConversationStore`).

use parley_types::conversation::{Conversation, ConversationRef, NewMessage, PersistedMessage};
use parley_types::error::StoreError;
use uuid::Uuid;

/// Repository trait for conversation and message persistence.
///
/// Every lookup is tenant-scoped: `find_owned` takes a `ConversationRef`
/// carrying the requester's user and organization ids and returns `None`
/// for conversations that exist but belong to someone else. The
/// coordinator never learns the difference.
pub trait ConversationStore: Send + Sync {
    /// Find the conversation the given reference names, scoped to its
    /// user and organization. Cross-tenant ids resolve to `None`.
    fn find_owned(
        &self,
        conversation: &ConversationRef,
    ) -> impl std::future::Future<Output = Result<Option<Conversation>, StoreError>> + Send;

    /// Create a new conversation for a tenant.
    fn create(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        title: String,
        context: serde_json::Value,
        metadata: serde_json::Value,
    ) -> impl std::future::Future<Output = Result<Conversation, StoreError>> + Send;

    /// Append a message to a conversation. The store assigns id and
    /// creation timestamp and bumps the conversation's updated_at.
    fn append_message(
        &self,
        message: &NewMessage,
    ) -> impl std::future::Future<Output = Result<PersistedMessage, StoreError>> + Send;

    /// Replace the conversation title.
    fn update_title(
        &self,
        conversation_id: &Uuid,
        title: String,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// List a tenant's conversations, most recently updated first.
    fn list_for_user(
        &self,
        user_id: &Uuid,
        org_id: &Uuid,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> impl std::future::Future<Output = Result<Vec<Conversation>, StoreError>> + Send;

    /// Get messages for a conversation, ordered by created_at ASC.
    fn get_messages(
        &self,
        conversation_id: &Uuid,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> impl std::future::Future<Output = Result<Vec<PersistedMessage>, StoreError>> + Send;

    /// Mark a conversation as closed.
    fn close(
        &self,
        conversation_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}
