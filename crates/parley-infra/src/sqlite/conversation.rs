//! SQLite conversation store implementation.
//!
//! Implements `ConversationStore` from `parley-core` using sqlx with split
//! read/write pools: raw queries, private Row structs, RFC 3339 timestamps,
//! JSON TEXT columns for context and metadata.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use parley_core::store::ConversationStore;
use parley_types::conversation::{
    Conversation, ConversationRef, ConversationStatus, MessageRole, NewMessage, PersistedMessage,
};
use parley_types::error::StoreError;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ConversationStore`.
pub struct SqliteConversationStore {
    pool: DatabasePool,
}

impl SqliteConversationStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Private Row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct ConversationRow {
    id: String,
    user_id: String,
    org_id: String,
    title: String,
    context: String,
    metadata: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl ConversationRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            org_id: row.try_get("org_id")?,
            title: row.try_get("title")?,
            context: row.try_get("context")?,
            metadata: row.try_get("metadata")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_conversation(self) -> Result<Conversation, StoreError> {
        let id = parse_uuid(&self.id, "conversation id")?;
        let user_id = parse_uuid(&self.user_id, "user_id")?;
        let org_id = parse_uuid(&self.org_id, "org_id")?;
        let status: ConversationStatus =
            self.status.parse().map_err(|e: String| StoreError::Query(e))?;

        Ok(Conversation {
            id,
            user_id,
            org_id,
            title: self.title,
            context: parse_json(&self.context)?,
            metadata: parse_json(&self.metadata)?,
            status,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct MessageRow {
    id: String,
    conversation_id: String,
    user_id: Option<String>,
    role: String,
    content: String,
    metadata: String,
    created_at: String,
}

impl MessageRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            user_id: row.try_get("user_id")?,
            role: row.try_get("role")?,
            content: row.try_get("content")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_message(self) -> Result<PersistedMessage, StoreError> {
        let id = parse_uuid(&self.id, "message id")?;
        let conversation_id = parse_uuid(&self.conversation_id, "conversation_id")?;
        let user_id = self
            .user_id
            .as_deref()
            .map(|s| parse_uuid(s, "user_id"))
            .transpose()?;
        let role: MessageRole = self.role.parse().map_err(|e: String| StoreError::Query(e))?;

        Ok(PersistedMessage {
            id,
            conversation_id,
            user_id,
            role,
            content: self.content,
            metadata: parse_json(&self.metadata)?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn map_sqlx_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Connection
        }
        other => StoreError::Query(other.to_string()),
    }
}

fn parse_uuid(s: &str, field: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Query(format!("invalid {field}: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_json(s: &str) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::Query(format!("invalid json column: {e}")))
}

// ---------------------------------------------------------------------------
// ConversationStore implementation
// ---------------------------------------------------------------------------

impl ConversationStore for SqliteConversationStore {
    async fn find_owned(
        &self,
        conversation: &ConversationRef,
    ) -> Result<Option<Conversation>, StoreError> {
        // Tenancy is part of the WHERE clause, not checked after fetch.
        let row = sqlx::query(
            "SELECT * FROM conversations WHERE id = ? AND user_id = ? AND org_id = ?",
        )
        .bind(conversation.conversation_id.to_string())
        .bind(conversation.user_id.to_string())
        .bind(conversation.org_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => {
                let conv_row = ConversationRow::from_row(&row)
                    .map_err(map_sqlx_error)?;
                Ok(Some(conv_row.into_conversation()?))
            }
            None => Ok(None),
        }
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

        sqlx::query(
            r#"INSERT INTO conversations (id, user_id, org_id, title, context, metadata, status, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(conversation.id.to_string())
        .bind(conversation.user_id.to_string())
        .bind(conversation.org_id.to_string())
        .bind(&conversation.title)
        .bind(conversation.context.to_string())
        .bind(conversation.metadata.to_string())
        .bind(conversation.status.to_string())
        .bind(format_datetime(&conversation.created_at))
        .bind(format_datetime(&conversation.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx_error)?;

        Ok(conversation)
    }

    async fn append_message(&self, message: &NewMessage) -> Result<PersistedMessage, StoreError> {
        let persisted = PersistedMessage {
            id: Uuid::now_v7(),
            conversation_id: message.conversation_id,
            user_id: message.user_id,
            role: message.role,
            content: message.content.clone(),
            metadata: message.metadata.clone(),
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"INSERT INTO messages (id, conversation_id, user_id, role, content, metadata, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(persisted.id.to_string())
        .bind(persisted.conversation_id.to_string())
        .bind(persisted.user_id.map(|u| u.to_string()))
        .bind(persisted.role.to_string())
        .bind(&persisted.content)
        .bind(persisted.metadata.to_string())
        .bind(format_datetime(&persisted.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx_error)?;

        // Bump the conversation's updated_at so listing order follows activity.
        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(format_datetime(&persisted.created_at))
            .bind(persisted.conversation_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx_error)?;

        Ok(persisted)
    }

    async fn update_title(&self, conversation_id: &Uuid, title: String) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE conversations SET title = ? WHERE id = ?")
            .bind(&title)
            .bind(conversation_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        Ok(())
    }

    async fn list_for_user(
        &self,
        user_id: &Uuid,
        org_id: &Uuid,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Conversation>, StoreError> {
        let mut sql = String::from(
            "SELECT * FROM conversations WHERE user_id = ? AND org_id = ? ORDER BY updated_at DESC",
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        let rows = sqlx::query(&sql)
            .bind(user_id.to_string())
            .bind(org_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx_error)?;

        let mut conversations = Vec::with_capacity(rows.len());
        for row in &rows {
            let conv_row =
                ConversationRow::from_row(row).map_err(map_sqlx_error)?;
            conversations.push(conv_row.into_conversation()?);
        }

        Ok(conversations)
    }

    async fn get_messages(
        &self,
        conversation_id: &Uuid,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<PersistedMessage>, StoreError> {
        let mut sql = String::from(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC",
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        let rows = sqlx::query(&sql)
            .bind(conversation_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx_error)?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let msg_row =
                MessageRow::from_row(row).map_err(map_sqlx_error)?;
            messages.push(msg_row.into_message()?);
        }

        Ok(messages)
    }

    async fn close(&self, conversation_id: &Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE conversations SET status = 'closed' WHERE id = ?")
            .bind(conversation_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::DatabasePool;

    async fn test_store() -> SqliteConversationStore {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        // Leak tempdir so it lives for the test
        std::mem::forget(dir);
        SqliteConversationStore::new(DatabasePool::new(&url).await.unwrap())
    }

    fn user_message(conversation_id: Uuid, user_id: Uuid, content: &str) -> NewMessage {
        NewMessage {
            conversation_id,
            user_id: Some(user_id),
            role: MessageRole::User,
            content: content.to_string(),
            metadata: serde_json::json!({ "source": "rest" }),
        }
    }

    #[tokio::test]
    async fn test_create_and_find_owned() {
        let store = test_store().await;
        let user_id = Uuid::now_v7();
        let org_id = Uuid::now_v7();

        let created = store
            .create(
                user_id,
                org_id,
                "Tax questions".to_string(),
                serde_json::json!({ "locale": "en" }),
                serde_json::json!({ "source": "rest" }),
            )
            .await
            .unwrap();

        let found = store
            .find_owned(&created.conversation_ref())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.title, "Tax questions");
        assert_eq!(found.status, ConversationStatus::Active);
        assert_eq!(found.context["locale"], "en");
        assert_eq!(found.metadata["source"], "rest");
    }

    #[tokio::test]
    async fn test_find_owned_scopes_by_tenant() {
        let store = test_store().await;
        let user_id = Uuid::now_v7();
        let org_id = Uuid::now_v7();

        let created = store
            .create(user_id, org_id, "t".into(), serde_json::json!({}), serde_json::json!({}))
            .await
            .unwrap();

        // Wrong user
        let found = store
            .find_owned(&ConversationRef {
                conversation_id: created.id,
                user_id: Uuid::now_v7(),
                org_id,
            })
            .await
            .unwrap();
        assert!(found.is_none());

        // Wrong org
        let found = store
            .find_owned(&ConversationRef {
                conversation_id: created.id,
                user_id,
                org_id: Uuid::now_v7(),
            })
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_closed_pool_surfaces_connection_error() {
        let store = test_store().await;
        store.pool.reader.close().await;

        let err = store
            .find_owned(&ConversationRef {
                conversation_id: Uuid::now_v7(),
                user_id: Uuid::now_v7(),
                org_id: Uuid::now_v7(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Connection));
    }

    #[tokio::test]
    async fn test_append_and_get_messages() {
        let store = test_store().await;
        let user_id = Uuid::now_v7();
        let org_id = Uuid::now_v7();
        let conversation = store
            .create(user_id, org_id, "t".into(), serde_json::json!({}), serde_json::json!({}))
            .await
            .unwrap();

        store
            .append_message(&user_message(conversation.id, user_id, "hello"))
            .await
            .unwrap();
        store
            .append_message(&NewMessage {
                conversation_id: conversation.id,
                user_id: None,
                role: MessageRole::Assistant,
                content: "hi there".to_string(),
                metadata: serde_json::json!({ "streaming": false }),
            })
            .await
            .unwrap();

        let messages = store.get_messages(&conversation.id, None, None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].user_id, Some(user_id));
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].user_id, None);
        assert_eq!(messages[1].metadata["streaming"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn test_append_rejects_unknown_conversation() {
        let store = test_store().await;
        let err = store
            .append_message(&user_message(Uuid::now_v7(), Uuid::now_v7(), "orphan"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Query(_)));
    }

    #[tokio::test]
    async fn test_update_title() {
        let store = test_store().await;
        let user_id = Uuid::now_v7();
        let org_id = Uuid::now_v7();
        let conversation = store
            .create(user_id, org_id, String::new(), serde_json::json!({}), serde_json::json!({}))
            .await
            .unwrap();

        store
            .update_title(&conversation.id, "Explain tax codes".to_string())
            .await
            .unwrap();

        let found = store
            .find_owned(&conversation.conversation_ref())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.title, "Explain tax codes");

        let err = store
            .update_title(&Uuid::now_v7(), "no such".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_list_for_user_ordering_and_paging() {
        let store = test_store().await;
        let user_id = Uuid::now_v7();
        let org_id = Uuid::now_v7();

        for i in 0..3 {
            let conversation = store
                .create(
                    user_id,
                    org_id,
                    format!("conversation {i}"),
                    serde_json::json!({}),
                    serde_json::json!({}),
                )
                .await
                .unwrap();
            // Touch the latest one so updated_at ordering is observable.
            if i == 2 {
                store
                    .append_message(&user_message(conversation.id, user_id, "bump"))
                    .await
                    .unwrap();
            }
        }
        // Different tenant should not appear.
        store
            .create(Uuid::now_v7(), org_id, "other".into(), serde_json::json!({}), serde_json::json!({}))
            .await
            .unwrap();

        let all = store.list_for_user(&user_id, &org_id, None, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].title, "conversation 2");

        let page = store.list_for_user(&user_id, &org_id, Some(2), Some(1)).await.unwrap();
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn test_close_conversation() {
        let store = test_store().await;
        let user_id = Uuid::now_v7();
        let org_id = Uuid::now_v7();
        let conversation = store
            .create(user_id, org_id, "t".into(), serde_json::json!({}), serde_json::json!({}))
            .await
            .unwrap();

        store.close(&conversation.id).await.unwrap();

        let found = store
            .find_owned(&conversation.conversation_ref())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.status, ConversationStatus::Closed);
    }
}
