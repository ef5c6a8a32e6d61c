//! Turn coordination: one user-message-in, assistant-message-out cycle.

pub mod coordinator;
pub mod guard;
pub mod title;

pub use coordinator::{TurnCoordinator, TurnStream};
pub use guard::{TurnGuard, TurnPermit};
