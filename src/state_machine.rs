//! Conversation state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions. The
//! runtime executes the effects a transition returns.

mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::{Choice, Effect};
pub use event::Event;
pub use state::{Applicant, ConvState, FlowStart, Step};
pub use transition::{prompt_for, transition, TransitionError, FILES_DONE};
