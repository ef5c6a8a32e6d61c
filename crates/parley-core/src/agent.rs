//! AgentPort trait definition.
//!
//! The AI backend capability consumed by the turn coordinator. Uses RPITIT
//! for `invoke` and `Pin<Box<dyn Stream>>` for `invoke_streaming` (streams
//! need to be nameable for the coordinator's 'static worker task).

use std::pin::Pin;

use futures_util::Stream;

use parley_types::agent::{AgentEvent, AgentInvocation, AgentReply};
use parley_types::error::AgentError;

/// A boxed, sendable stream of agent events.
pub type AgentEventStream =
    Pin<Box<dyn Stream<Item = Result<AgentEvent, AgentError>> + Send + 'static>>;

/// Trait for AI agent backends.
///
/// Implementations live in parley-infra (e.g., `OpenAiAgent`). The gateway
/// treats the backend as opaque: given an invocation, it produces either a
/// complete reply or a lazy, finite, non-restartable sequence of events,
/// each yield of which may fail independently and terminate the sequence.
pub trait AgentPort: Send + Sync {
    /// Human-readable backend name (for logs and metadata).
    fn name(&self) -> &str;

    /// Run the invocation to completion and return the full reply.
    fn invoke(
        &self,
        invocation: &AgentInvocation,
    ) -> impl std::future::Future<Output = Result<AgentReply, AgentError>> + Send;

    /// Run the invocation in streaming mode.
    ///
    /// The returned stream is pulled cooperatively: the next event is not
    /// produced until the previous one has been consumed, so backpressure
    /// applied by the caller reaches the backend.
    fn invoke_streaming(&self, invocation: AgentInvocation) -> AgentEventStream;
}
