//! Turn request/response types for the Parley gateway.
//!
//! A turn is one user-message-in, assistant-message-out cycle within a
//! conversation. These shapes are transport-independent: REST, WebSocket,
//! and any future push-capable adapter all build the same `TurnRequest`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::TurnError;

/// Which agent drives the turn.
///
/// Mirrors the agent taxonomy of the backend orchestrator; the gateway
/// treats the value as an opaque routing hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Master,
    Query,
    Action,
    Analytics,
    Scheduler,
    Compliance,
    Help,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentKind::Master => write!(f, "master"),
            AgentKind::Query => write!(f, "query"),
            AgentKind::Action => write!(f, "action"),
            AgentKind::Analytics => write!(f, "analytics"),
            AgentKind::Scheduler => write!(f, "scheduler"),
            AgentKind::Compliance => write!(f, "compliance"),
            AgentKind::Help => write!(f, "help"),
        }
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "master" => Ok(AgentKind::Master),
            "query" => Ok(AgentKind::Query),
            "action" => Ok(AgentKind::Action),
            "analytics" => Ok(AgentKind::Analytics),
            "scheduler" => Ok(AgentKind::Scheduler),
            "compliance" => Ok(AgentKind::Compliance),
            "help" => Ok(AgentKind::Help),
            other => Err(format!("invalid agent kind: '{other}'")),
        }
    }
}

/// Transport (or trigger) a turn originated from. Recorded in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnSource {
    Rest,
    Websocket,
    Grpc,
    Scheduled,
}

impl fmt::Display for TurnSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnSource::Rest => write!(f, "rest"),
            TurnSource::Websocket => write!(f, "websocket"),
            TurnSource::Grpc => write!(f, "grpc"),
            TurnSource::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// Agent-selection parameters for a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentParams {
    pub kind: AgentKind,
    pub model: String,
    pub temperature: f64,
    pub max_output_tokens: u32,
}

/// Lowest accepted sampling temperature.
pub const MIN_TEMPERATURE: f64 = 0.0;
/// Highest accepted sampling temperature.
pub const MAX_TEMPERATURE: f64 = 2.0;
/// Highest accepted output size, in tokens.
pub const MAX_OUTPUT_TOKENS: u32 = 8000;

/// One conversation turn, as requested by a transport adapter.
///
/// Immutable once constructed; `validate` is the single gate every adapter
/// goes through before the coordinator touches storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    /// Target conversation; `None` means "create a new one".
    pub conversation_id: Option<Uuid>,
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub message: String,
    pub agent: AgentParams,
    /// Free-form context map forwarded to the agent backend.
    #[serde(default)]
    pub context: serde_json::Value,
    pub source: TurnSource,
}

impl TurnRequest {
    /// Check structural validity: non-empty message, parameters in range.
    pub fn validate(&self) -> Result<(), TurnError> {
        if self.message.trim().is_empty() {
            return Err(TurnError::InvalidRequest("message must not be empty".into()));
        }
        if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&self.agent.temperature) {
            return Err(TurnError::InvalidRequest(format!(
                "temperature {} outside [{MIN_TEMPERATURE}, {MAX_TEMPERATURE}]",
                self.agent.temperature
            )));
        }
        if self.agent.max_output_tokens == 0 || self.agent.max_output_tokens > MAX_OUTPUT_TOKENS {
            return Err(TurnError::InvalidRequest(format!(
                "max_output_tokens {} outside [1, {MAX_OUTPUT_TOKENS}]",
                self.agent.max_output_tokens
            )));
        }
        Ok(())
    }
}

/// Token usage for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// One incremental piece of a streamed response.
///
/// Fragments of a turn are strictly ordered by `index`. The final fragment
/// closes the stream and may carry usage, timing, and an error indicator
/// when the stream terminated early.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub index: u64,
    pub delta: String,
    pub is_final: bool,
    /// Set on the final fragment when the turn ended abnormally. The
    /// partial content forwarded so far was still persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl Fragment {
    /// A non-final delta fragment.
    pub fn delta(index: u64, delta: impl Into<String>) -> Self {
        Self {
            index,
            delta: delta.into(),
            is_final: false,
            error: None,
            usage: None,
            elapsed_ms: None,
        }
    }

    /// The synthetic fragment that closes a successful stream.
    pub fn complete(index: u64, usage: TokenUsage, elapsed_ms: u64) -> Self {
        Self {
            index,
            delta: String::new(),
            is_final: true,
            error: None,
            usage: Some(usage),
            elapsed_ms: Some(elapsed_ms),
        }
    }

    /// The synthetic fragment that closes a failed or interrupted stream.
    pub fn failed(index: u64, error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            index,
            delta: String::new(),
            is_final: true,
            error: Some(error.into()),
            usage: None,
            elapsed_ms: Some(elapsed_ms),
        }
    }
}

/// The fully assembled output of a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub conversation_id: Uuid,
    /// Id of the persisted assistant message.
    pub message_id: Uuid,
    pub content: String,
    pub usage: TokenUsage,
    pub elapsed_ms: u64,
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> TurnRequest {
        TurnRequest {
            conversation_id: None,
            user_id: Uuid::now_v7(),
            org_id: Uuid::now_v7(),
            message: "Explain tax codes".to_string(),
            agent: AgentParams {
                kind: AgentKind::Master,
                model: "gpt-4o".to_string(),
                temperature: 0.7,
                max_output_tokens: 2048,
            },
            context: serde_json::json!({}),
            source: TurnSource::Rest,
        }
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(valid_request().validate().is_ok());
    }

    #[test]
    fn test_empty_message_rejected() {
        let mut req = valid_request();
        req.message = "   ".to_string();
        assert!(matches!(req.validate(), Err(TurnError::InvalidRequest(_))));
    }

    #[test]
    fn test_temperature_bounds() {
        let mut req = valid_request();
        req.agent.temperature = 2.0;
        assert!(req.validate().is_ok());
        req.agent.temperature = 2.1;
        assert!(matches!(req.validate(), Err(TurnError::InvalidRequest(_))));
        req.agent.temperature = -0.1;
        assert!(matches!(req.validate(), Err(TurnError::InvalidRequest(_))));
    }

    #[test]
    fn test_max_output_tokens_bounds() {
        let mut req = valid_request();
        req.agent.max_output_tokens = 0;
        assert!(matches!(req.validate(), Err(TurnError::InvalidRequest(_))));
        req.agent.max_output_tokens = 8000;
        assert!(req.validate().is_ok());
        req.agent.max_output_tokens = 8001;
        assert!(matches!(req.validate(), Err(TurnError::InvalidRequest(_))));
    }

    #[test]
    fn test_agent_kind_roundtrip() {
        for kind in [
            AgentKind::Master,
            AgentKind::Query,
            AgentKind::Action,
            AgentKind::Analytics,
            AgentKind::Scheduler,
            AgentKind::Compliance,
            AgentKind::Help,
        ] {
            let parsed: AgentKind = kind.to_string().parse().unwrap();
            assert_eq!(kind, parsed);
        }
    }

    #[test]
    fn test_fragment_serde_omits_empty_fields() {
        let frag = Fragment::delta(0, "Hel");
        let json = serde_json::to_string(&frag).unwrap();
        assert!(!json.contains("error"));
        assert!(!json.contains("usage"));
    }

    #[test]
    fn test_final_fragment_carries_usage() {
        let frag = Fragment::complete(3, TokenUsage { input_tokens: 10, output_tokens: 20 }, 125);
        assert!(frag.is_final);
        assert!(frag.error.is_none());
        assert_eq!(frag.usage.unwrap().output_tokens, 20);
        assert_eq!(frag.elapsed_ms, Some(125));
    }

    #[test]
    fn test_failed_fragment_carries_error() {
        let frag = Fragment::failed(2, "stream error: boom", 50);
        assert!(frag.is_final);
        assert_eq!(frag.error.as_deref(), Some("stream error: boom"));
        assert!(frag.usage.is_none());
    }
}
