//! Runtime for conversational flows
//!
//! The engine applies the pure state machine to per-user sessions and
//! carries out the resulting effects against the store and the messenger.

mod engine;
mod error;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use engine::{Completion, FlowEngine, FlowRequest, Input, SubmitOutcome};
pub use error::FlowError;
pub use traits::*;

/// Engine wired to the production store; the messenger is chosen at startup
pub type ProductionEngine = FlowEngine<DatabaseStore, dyn Messenger>;
