//! Event system for memory-break evaluations
//!
//! Provides the broadcast bus and the event types that report task and
//! session progress while an evaluation runs.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
