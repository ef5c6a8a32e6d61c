//! Core orchestration for the Parley chat gateway.
//!
//! Two components live here:
//!
//! - [`turn::TurnCoordinator`] — drives one conversation turn to completion,
//!   sync or streaming, with identical persistence guarantees regardless of
//!   which transport invoked it.
//! - [`registry::ConnectionRegistry`] — thread-safe bookkeeping of live
//!   duplex connections and best-effort fan-out, decoupled from any
//!   specific transport.
//!
//! The coordinator consumes two capabilities as traits: [`agent::AgentPort`]
//! (the AI backend) and [`store::ConversationStore`] (persistence).
//! Implementations live in parley-infra; in-memory doubles for tests live
//! in [`testing`].

pub mod agent;
pub mod registry;
pub mod store;
pub mod testing;
pub mod turn;
