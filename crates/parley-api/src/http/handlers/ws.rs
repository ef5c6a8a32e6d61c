//! WebSocket handler for bidirectional chat.
//!
//! The `/ws/chat` endpoint upgrades an HTTP connection to a WebSocket.
//! Once connected, the handler:
//!
//! - **Registers the connection:** a [`Connection`] backed by an mpsc sink
//!   is added to the shared [`ConnectionRegistry`], so turn workers can push
//!   frames to this socket by connection id.
//! - **Receives commands:** parses incoming text frames as [`WsCommand`]
//!   and starts streaming turns or answers pings.
//!
//! Turns run in spawned tasks so the socket loop stays responsive; each
//! turn relays its fragments through the registry. Disconnecting cancels
//! any in-flight turns for the connection. Partial output produced before
//! the disconnect is still persisted by the coordinator.
//!
//! Outbound frame types:
//! - `{"type":"accepted","conversation_id":...}` — turn started
//! - `{"type":"fragment","fragment":{...}}` — incremental output
//! - `{"type":"error","code":...,"message":...}` — turn failed to start
//! - `{"type":"pong"}` — reply to a ping

use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::{Future, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use parley_core::registry::{Connection, ConnectionSink};
use parley_types::error::{RegistryError, TurnError};
use parley_types::turn::{AgentKind, AgentParams, TurnRequest, TurnSource};

use crate::http::error::AppError;
use crate::http::handlers::chat;
use crate::http::extractors::auth::{authenticate_token, Authenticated};
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Outbound frame buffer per connection.
const OUTBOUND_BUFFER: usize = 64;

/// Incoming command from a WebSocket client.
///
/// Clients send JSON-encoded text frames matching one of these variants.
/// Unknown or malformed messages are logged and ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsCommand {
    /// Run a streaming turn on this connection.
    ChatMessage {
        conversation_id: Option<Uuid>,
        message: String,
        agent: Option<String>,
        model: Option<String>,
        temperature: Option<f64>,
        max_output_tokens: Option<u32>,
        context: Option<serde_json::Value>,
    },
    /// Keep-alive ping. Server responds with `{"type":"pong"}`.
    Ping,
}

/// Query parameters for the WebSocket upgrade request.
///
/// Browsers cannot set headers on WebSocket upgrades, so the token rides
/// in the query string instead.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: String,
}

/// Sink adapter that forwards registry payloads into this connection's
/// outbound channel.
struct WsSink {
    tx: mpsc::Sender<String>,
}

impl ConnectionSink for WsSink {
    fn send(
        &self,
        payload: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), RegistryError>> + Send + '_>> {
        Box::pin(async move {
            self.tx
                .send(payload)
                .await
                .map_err(|_| RegistryError::SendFailed("connection closed".to_string()))
        })
    }
}

/// Upgrade an HTTP request to a WebSocket chat connection.
///
/// This is mounted at `/ws/chat` in the router. Authentication happens
/// before the upgrade, so bad tokens get a plain 401 instead of a
/// half-open socket.
pub async fn ws_chat(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsAuthQuery>,
) -> Result<impl IntoResponse, AppError> {
    let auth = authenticate_token(&state, &query.token)?;
    Ok(ws.on_upgrade(move |socket| handle_ws_connection(socket, state, auth)))
}

/// GET /ws/status - Connection registry counts.
pub async fn ws_status(
    State(state): State<AppState>,
    _auth: Authenticated,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let request_id = uuid::Uuid::now_v7().to_string();
    let data = serde_json::json!({
        "connections": state.registry.connection_count(),
        "users": state.registry.user_count(),
        "in_flight_turns": state.coordinator.in_flight_turns(),
    });
    Ok(Json(ApiResponse::success(data, request_id, 0)))
}

/// Core WebSocket connection handler.
///
/// Uses `tokio::select!` to multiplex between the outbound channel (fed by
/// turn workers through the registry) and incoming WebSocket frames. This
/// approach keeps both sender and receiver in a single task, enabling
/// bidirectional communication (e.g., responding to `Ping` with a pong).
async fn handle_ws_connection(socket: WebSocket, state: AppState, auth: Authenticated) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let connection = Connection::new(auth.user_id, Arc::new(WsSink { tx }));
    let connection_id = connection.id;
    state.registry.register(connection);

    // Dropping the socket cancels every turn started on it.
    let cancel = CancellationToken::new();

    tracing::debug!(%connection_id, user_id = %auth.user_id, "WebSocket connected");

    loop {
        tokio::select! {
            // --- Branch 1: Forward registry payloads to the client ---
            payload = outbound_rx.recv() => {
                match payload {
                    Some(json) => {
                        if ws_sender.send(Message::Text(json.into())).await.is_err() {
                            // Client disconnected
                            break;
                        }
                    }
                    None => break,
                }
            }

            // --- Branch 2: Process commands from the client ---
            msg_result = ws_receiver.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        process_command(
                            &text,
                            &mut ws_sender,
                            &state,
                            auth,
                            connection_id,
                            &cancel,
                        ).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        // Client disconnected
                        break;
                    }
                    Some(Err(err)) => {
                        tracing::debug!("WebSocket receive error: {err}");
                        break;
                    }
                    // Ignore binary, ping, pong protocol frames (handled by axum/tungstenite)
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    cancel.cancel();
    state.registry.unregister(&connection_id);
    tracing::debug!(%connection_id, "WebSocket connection closed");
}

/// Parse and process a single command from the WebSocket client.
async fn process_command(
    text: &str,
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    state: &AppState,
    auth: Authenticated,
    connection_id: Uuid,
    cancel: &CancellationToken,
) {
    let cmd: WsCommand = match serde_json::from_str(text) {
        Ok(cmd) => cmd,
        Err(err) => {
            tracing::warn!(
                raw = %text,
                error = %err,
                "Ignoring malformed WebSocket command"
            );
            return;
        }
    };

    match cmd {
        WsCommand::ChatMessage {
            conversation_id,
            message,
            agent,
            model,
            temperature,
            max_output_tokens,
            context,
        } => {
            let kind = match agent.as_deref() {
                Some(s) => match AgentKind::from_str(s) {
                    Ok(kind) => kind,
                    Err(err) => {
                        send_error_frame(ws_sender, "VALIDATION_ERROR", &err).await;
                        return;
                    }
                },
                None => AgentKind::Master,
            };

            let request = TurnRequest {
                conversation_id,
                user_id: auth.user_id,
                org_id: auth.org_id,
                message,
                agent: AgentParams {
                    kind,
                    model: model
                        .unwrap_or_else(|| state.config.agent.default_model.clone()),
                    temperature: temperature.unwrap_or(chat::DEFAULT_TEMPERATURE),
                    max_output_tokens: max_output_tokens
                        .unwrap_or(chat::DEFAULT_MAX_OUTPUT_TOKENS),
                },
                context: context.unwrap_or_else(|| serde_json::json!({})),
                source: TurnSource::Websocket,
            };

            run_ws_turn(ws_sender, state, request, connection_id, cancel.child_token()).await;
        }
        WsCommand::Ping => {
            let pong = r#"{"type":"pong"}"#;
            if ws_sender.send(Message::Text(pong.into())).await.is_err() {
                tracing::debug!("Failed to send pong (client disconnecting)");
            }
        }
    }
}

/// Start a streaming turn and relay its fragments through the registry.
///
/// Setup errors (busy conversation, unknown id, validation) are reported
/// on the socket immediately; once the stream is live, a worker task owns
/// the relay so the socket loop can keep processing commands and pings.
async fn run_ws_turn(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    state: &AppState,
    request: TurnRequest,
    connection_id: Uuid,
    cancel: CancellationToken,
) {
    let fragments = match state
        .coordinator
        .run_turn_stream(request, cancel)
        .await
    {
        Ok(fragments) => fragments,
        Err(err) => {
            let code = match &err {
                TurnError::ConversationBusy => "CONVERSATION_BUSY",
                TurnError::ConversationNotFound => "CONVERSATION_NOT_FOUND",
                TurnError::InvalidRequest(_) => "VALIDATION_ERROR",
                _ => "TURN_ERROR",
            };
            send_error_frame(ws_sender, code, &err.to_string()).await;
            return;
        }
    };

    let accepted = serde_json::json!({
        "type": "accepted",
        "conversation_id": fragments.conversation_id.to_string(),
    });
    if ws_sender.send(Message::Text(accepted.to_string().into())).await.is_err() {
        tracing::debug!("Failed to send accepted frame (client disconnecting)");
    }

    let registry = Arc::clone(&state.registry);
    tokio::spawn(async move {
        let mut fragments = std::pin::pin!(fragments);
        while let Some(fragment) = fragments.next().await {
            let frame = serde_json::json!({
                "type": "fragment",
                "fragment": fragment,
            });
            if registry.send_to(&connection_id, &frame.to_string()).await.is_err() {
                // Connection gone; the coordinator notices via backpressure
                // or channel close and persists what it has.
                tracing::debug!(%connection_id, "Dropping fragment relay, connection gone");
                break;
            }
        }
    });
}

/// Push an error frame to the client, ignoring delivery failures.
async fn send_error_frame(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    code: &str,
    message: &str,
) {
    let frame = serde_json::json!({
        "type": "error",
        "code": code,
        "message": message,
    });
    if ws_sender.send(Message::Text(frame.to_string().into())).await.is_err() {
        tracing::debug!("Failed to send error frame (client disconnecting)");
    }
}
