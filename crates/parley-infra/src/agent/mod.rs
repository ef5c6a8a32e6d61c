//! Agent backend implementations.
//!
//! `AgentPort` over any API speaking the OpenAI chat completions protocol.

pub mod openai;
