use thiserror::Error;

/// Errors from conversation store operations (used by trait definitions
/// in parley-core).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from agent backend operations.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent backend error: {message}")]
    Provider { message: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// Where a turn's persistence failed relative to its writes.
///
/// Adapters use this to decide user-facing messaging: `BeforeWrite` means
/// nothing was stored, `PartialWrite` means the user message (and possibly
/// partial assistant output) is committed, `AfterWrite` means only a
/// follow-up write such as the title update failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePhase {
    BeforeWrite,
    PartialWrite,
    AfterWrite,
}

impl std::fmt::Display for WritePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WritePhase::BeforeWrite => write!(f, "before any write"),
            WritePhase::PartialWrite => write!(f, "after partial write"),
            WritePhase::AfterWrite => write!(f, "after all message writes"),
        }
    }
}

/// Errors surfaced by the turn coordinator.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The conversation does not exist for this tenant. Cross-tenant ids
    /// deliberately map here as well: existence is never revealed.
    #[error("conversation not found")]
    ConversationNotFound,

    /// Another turn on the same conversation is in flight.
    #[error("conversation busy: a turn is already in flight")]
    ConversationBusy,

    #[error("agent invocation failed: {0}")]
    AgentInvocation(#[from] AgentError),

    #[error("persistence failed {phase}: {source}")]
    Persistence {
        phase: WritePhase,
        source: StoreError,
    },

    /// The client could not keep up with the stream within the forward
    /// timeout. Treated as early termination, not a hard failure.
    #[error("stream backpressure timeout")]
    BackpressureTimeout,

    #[error("turn cancelled")]
    Cancelled,
}

impl TurnError {
    /// Whether a caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TurnError::ConversationBusy | TurnError::BackpressureTimeout)
    }
}

/// Errors from connection registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection not found")]
    ConnectionNotFound,

    #[error("send failed: {0}")]
    SendFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_error_display() {
        let err = TurnError::Persistence {
            phase: WritePhase::PartialWrite,
            source: StoreError::Query("disk full".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("after partial write"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn test_agent_error_wraps_into_turn_error() {
        let err: TurnError = AgentError::Provider { message: "upstream 502".to_string() }.into();
        assert!(matches!(err, TurnError::AgentInvocation(_)));
        assert!(err.to_string().contains("upstream 502"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(TurnError::ConversationBusy.is_retryable());
        assert!(TurnError::BackpressureTimeout.is_retryable());
        assert!(!TurnError::ConversationNotFound.is_retryable());
        assert!(!TurnError::InvalidRequest("x".into()).is_retryable());
    }

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::SendFailed("socket closed".to_string());
        assert_eq!(err.to_string(), "send failed: socket closed");
    }
}
