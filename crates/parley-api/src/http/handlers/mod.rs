//! HTTP request handlers for the REST and WebSocket API.

pub mod chat;
pub mod conversation;
pub mod ws;
