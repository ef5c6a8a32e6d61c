//! Shared domain types for the Parley chat gateway.
//!
//! Pure data shapes and error enums used across the workspace. No async,
//! no IO: everything here is constructible in a unit test without a
//! runtime or a database.

pub mod agent;
pub mod conversation;
pub mod error;
pub mod turn;
