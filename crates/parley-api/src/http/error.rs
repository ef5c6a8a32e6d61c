//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use parley_types::error::{StoreError, TurnError};

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Turn coordination errors.
    Turn(TurnError),
    /// Direct store access errors (listing, message reads).
    Store(StoreError),
    /// Authentication failure.
    Unauthorized(String),
    /// Validation error.
    Validation(String),
    /// Generic internal error.
    Internal(String),
}

impl From<TurnError> for AppError {
    fn from(e: TurnError) -> Self {
        AppError::Turn(e)
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Store(e)
    }
}

impl AppError {
    fn status_code_and_message(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Turn(TurnError::InvalidRequest(msg)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::Turn(TurnError::ConversationNotFound) => (
                StatusCode::NOT_FOUND,
                "CONVERSATION_NOT_FOUND",
                "Conversation not found".to_string(),
            ),
            AppError::Turn(TurnError::ConversationBusy) => (
                StatusCode::CONFLICT,
                "CONVERSATION_BUSY",
                "A turn is already in flight for this conversation".to_string(),
            ),
            AppError::Turn(TurnError::BackpressureTimeout) => (
                StatusCode::REQUEST_TIMEOUT,
                "STREAM_TIMEOUT",
                "Client did not keep up with the stream".to_string(),
            ),
            AppError::Turn(TurnError::AgentInvocation(e)) => {
                (StatusCode::BAD_GATEWAY, "AGENT_ERROR", e.to_string())
            }
            AppError::Turn(e @ TurnError::Persistence { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "PERSISTENCE_ERROR", e.to_string())
            }
            AppError::Turn(TurnError::Cancelled) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "TURN_CANCELLED",
                "Turn was cancelled".to_string(),
            ),
            AppError::Store(StoreError::NotFound) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "Resource not found".to_string(),
            ),
            AppError::Store(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", e.to_string())
            }
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.status_code_and_message();

        let body = json!({
            "data": null,
            "meta": {
                "request_id": "",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "response_time_ms": 0
            },
            "errors": [{
                "code": code,
                "message": message,
            }]
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::error::{AgentError, WritePhase};

    #[test]
    fn test_turn_error_status_mapping() {
        let cases: Vec<(AppError, StatusCode)> = vec![
            (AppError::Turn(TurnError::InvalidRequest("x".into())), StatusCode::BAD_REQUEST),
            (AppError::Turn(TurnError::ConversationNotFound), StatusCode::NOT_FOUND),
            (AppError::Turn(TurnError::ConversationBusy), StatusCode::CONFLICT),
            (AppError::Turn(TurnError::BackpressureTimeout), StatusCode::REQUEST_TIMEOUT),
            (
                AppError::Turn(TurnError::AgentInvocation(AgentError::Provider {
                    message: "upstream".into(),
                })),
                StatusCode::BAD_GATEWAY,
            ),
            (
                AppError::Turn(TurnError::Persistence {
                    phase: WritePhase::PartialWrite,
                    source: StoreError::Query("disk".into()),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (AppError::Unauthorized("no".into()), StatusCode::UNAUTHORIZED),
        ];

        for (err, expected) in cases {
            let (status, _, _) = err.status_code_and_message();
            assert_eq!(status, expected);
        }
    }

    #[test]
    fn test_store_not_found_is_404() {
        let (status, code, _) = AppError::Store(StoreError::NotFound).status_code_and_message();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code, "NOT_FOUND");
    }
}
