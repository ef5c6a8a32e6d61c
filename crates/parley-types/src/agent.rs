//! Agent backend request/response types.
//!
//! These model the gateway's view of the AI backend: a prompt with
//! conversation history in, either a complete reply or a stream of events
//! out. The backend's reasoning is opaque to the gateway.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::MessageRole;
use crate::turn::{AgentKind, TokenUsage};

/// One prior exchange message handed to the agent as context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: MessageRole,
    pub content: String,
}

/// A fully built agent invocation.
///
/// The coordinator constructs this from a validated `TurnRequest` plus the
/// conversation's stored history; the agent port never sees raw transport
/// shapes.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub conversation_id: Uuid,
    pub message: String,
    pub history: Vec<HistoryMessage>,
    pub kind: AgentKind,
    pub model: String,
    pub temperature: f64,
    pub max_output_tokens: u32,
    pub context: serde_json::Value,
}

/// The complete (non-streaming) reply from the agent backend.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Events emitted by a streaming agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A delta of generated text.
    TextDelta { text: String },
    /// Token usage, typically reported near the end of the stream.
    Usage(TokenUsage),
    /// The stream has completed.
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_event_serde_tags() {
        let ev = AgentEvent::TextDelta { text: "Hel".to_string() };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"text_delta\""));

        let done: AgentEvent = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert!(matches!(done, AgentEvent::Done));
    }

    #[test]
    fn test_usage_event_roundtrip() {
        let ev = AgentEvent::Usage(TokenUsage { input_tokens: 5, output_tokens: 9 });
        let json = serde_json::to_string(&ev).unwrap();
        let parsed: AgentEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            AgentEvent::Usage(u) => assert_eq!(u.output_tokens, 9),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
