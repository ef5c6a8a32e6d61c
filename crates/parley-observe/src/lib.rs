//! Observability setup for the Parley gateway.

pub mod genai_attrs;
pub mod tracing_setup;
