//! Chat turn endpoints.
//!
//! POST /api/v1/chat        — run one turn, return the full assistant reply
//! POST /api/v1/chat/stream — run one turn, stream fragments as SSE
//!
//! SSE event types:
//! - `conversation` — initial event with `{ "conversation_id": "..." }`
//! - `fragment` — incremental output: a serialized [`Fragment`]
//! - `done` — stream complete: `{}`
//!
//! The final `fragment` event carries `is_final: true` plus usage and
//! timing; on abnormal termination it carries an `error` string instead,
//! after any partial content has already been persisted.

use std::convert::Infallible;
use std::str::FromStr;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use parley_types::turn::{AgentKind, AgentParams, TurnRequest, TurnResult, TurnSource};

use crate::http::error::AppError;
use crate::http::extractors::auth::Authenticated;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Default sampling temperature when the request does not set one.
pub(crate) const DEFAULT_TEMPERATURE: f64 = 0.7;
/// Default output token budget when the request does not set one.
pub(crate) const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 2048;

/// Request body for both chat endpoints.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// Existing conversation to continue; if absent, a new one is created.
    pub conversation_id: Option<Uuid>,
    /// The user message.
    pub message: String,
    /// Agent kind to route to (defaults to "master").
    pub agent: Option<String>,
    /// Model override; defaults to the configured model.
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_output_tokens: Option<u32>,
    /// Free-form context forwarded to the agent backend.
    pub context: Option<serde_json::Value>,
}

/// Build a [`TurnRequest`] from the HTTP body and the authenticated tenant.
fn build_turn_request(
    state: &AppState,
    auth: Authenticated,
    body: ChatRequest,
    source: TurnSource,
) -> Result<TurnRequest, AppError> {
    let kind = match body.agent.as_deref() {
        Some(s) => AgentKind::from_str(s).map_err(AppError::Validation)?,
        None => AgentKind::Master,
    };

    Ok(TurnRequest {
        conversation_id: body.conversation_id,
        user_id: auth.user_id,
        org_id: auth.org_id,
        message: body.message,
        agent: AgentParams {
            kind,
            model: body
                .model
                .unwrap_or_else(|| state.config.agent.default_model.clone()),
            temperature: body.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_output_tokens: body.max_output_tokens.unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS),
        },
        context: body.context.unwrap_or_else(|| serde_json::json!({})),
        source,
    })
}

/// POST /api/v1/chat — run a complete turn and return the assistant reply.
pub async fn chat(
    State(state): State<AppState>,
    auth: Authenticated,
    Json(body): Json<ChatRequest>,
) -> Result<Json<ApiResponse<TurnResult>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let request = build_turn_request(&state, auth, body, TurnSource::Rest)?;
    let result = state.coordinator.run_turn(request).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    Ok(Json(ApiResponse::success(result, request_id, elapsed)))
}

/// POST /api/v1/chat/stream — SSE streaming turn.
pub async fn stream_chat(
    State(state): State<AppState>,
    auth: Authenticated,
    Json(body): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let request = build_turn_request(&state, auth, body, TurnSource::Rest)?;

    // Setup failures (validation, unknown conversation, busy) surface as
    // plain HTTP errors before any SSE bytes are written.
    let fragments = state
        .coordinator
        .run_turn_stream(request, CancellationToken::new())
        .await?;

    let conversation_id = fragments.conversation_id;

    let sse_stream = async_stream::stream! {
        let opening = serde_json::json!({ "conversation_id": conversation_id.to_string() });
        yield Ok::<_, Infallible>(Event::default().event("conversation").data(opening.to_string()));

        let mut fragments = std::pin::pin!(fragments);

        while let Some(fragment) = fragments.next().await {
            let data = serde_json::to_string(&fragment).unwrap_or_default();
            yield Ok::<_, Infallible>(Event::default().event("fragment").data(data));
            if fragment.is_final {
                break;
            }
        }

        yield Ok(Event::default().event("done").data("{}"));
    };

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
