//! HTTP/REST and WebSocket API layer for Parley.
//!
//! Axum-based API at `/api/v1/` with bearer token authentication,
//! envelope response format, SSE streaming, and CORS support.

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod response;
pub mod router;
