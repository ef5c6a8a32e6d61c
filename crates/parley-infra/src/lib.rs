//! Infrastructure implementations for the Parley gateway.
//!
//! SQLite persistence, the OpenAI-compatible agent backend, and the
//! config.toml loader. Everything here implements a capability trait from
//! `parley-core`; the gateway's behavior lives in core, not here.

pub mod agent;
pub mod config;
pub mod sqlite;
