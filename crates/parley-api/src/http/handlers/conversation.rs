//! Conversation CRUD handlers for the REST API.
//!
//! Every handler resolves the conversation through `find_owned` first, so
//! cross-tenant ids return 404 without revealing that they exist.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use parley_core::store::ConversationStore;
use parley_types::conversation::{Conversation, ConversationRef, PersistedMessage};
use parley_types::error::StoreError;

use crate::http::error::AppError;
use crate::http::extractors::auth::Authenticated;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Request body for conversation creation.
#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub title: Option<String>,
    pub context: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

/// Pagination query parameters.
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// POST /api/v1/conversations - Create an empty conversation.
pub async fn create_conversation(
    State(state): State<AppState>,
    auth: Authenticated,
    Json(body): Json<CreateConversationRequest>,
) -> Result<Json<ApiResponse<Conversation>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let conversation = state
        .store
        .create(
            auth.user_id,
            auth.org_id,
            body.title.unwrap_or_default(),
            body.context.unwrap_or_else(|| serde_json::json!({})),
            body.metadata.unwrap_or_else(|| serde_json::json!({})),
        )
        .await?;
    let elapsed = start.elapsed().as_millis() as u64;

    Ok(Json(ApiResponse::success(conversation, request_id, elapsed)))
}

/// GET /api/v1/conversations - List the tenant's conversations.
pub async fn list_conversations(
    State(state): State<AppState>,
    auth: Authenticated,
    Query(page): Query<PageQuery>,
) -> Result<Json<ApiResponse<Vec<Conversation>>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let conversations = state
        .store
        .list_for_user(&auth.user_id, &auth.org_id, page.limit, page.offset)
        .await?;
    let elapsed = start.elapsed().as_millis() as u64;

    Ok(Json(ApiResponse::success(conversations, request_id, elapsed)))
}

/// GET /api/v1/conversations/{id} - Fetch a single conversation.
pub async fn get_conversation(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Conversation>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let conversation = resolve_owned(&state, &auth, &id).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    Ok(Json(ApiResponse::success(conversation, request_id, elapsed)))
}

/// GET /api/v1/conversations/{id}/messages - List messages in order.
pub async fn get_messages(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> Result<Json<ApiResponse<Vec<PersistedMessage>>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    resolve_owned(&state, &auth, &id).await?;
    let messages = state
        .store
        .get_messages(&id, page.limit, page.offset)
        .await?;
    let elapsed = start.elapsed().as_millis() as u64;

    Ok(Json(ApiResponse::success(messages, request_id, elapsed)))
}

/// POST /api/v1/conversations/{id}/close - Mark a conversation closed.
pub async fn close_conversation(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    resolve_owned(&state, &auth, &id).await?;
    state.store.close(&id).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    Ok(Json(ApiResponse::success(
        serde_json::json!({ "id": id, "status": "closed" }),
        request_id,
        elapsed,
    )))
}

/// Tenant-scoped conversation lookup shared by the ID-addressed handlers.
async fn resolve_owned(
    state: &AppState,
    auth: &Authenticated,
    id: &Uuid,
) -> Result<Conversation, AppError> {
    state
        .store
        .find_owned(&ConversationRef {
            conversation_id: *id,
            user_id: auth.user_id,
            org_id: auth.org_id,
        })
        .await?
        .ok_or(AppError::Store(StoreError::NotFound))
}
