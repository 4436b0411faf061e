//! Flow error taxonomy
//!
//! Store and transition errors are folded into `FlowError` at the engine
//! boundary. Every variant knows how to explain itself to the user.

use super::traits::DeliveryError;
use crate::db::DbError;
use crate::state_machine::{Step, TransitionError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// Input refused; the engine turns this into a re-prompt
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("A registration request is already pending")]
    DuplicateRequest,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Missing permission, e.g. "admin rights"
    #[error("Forbidden: requires {0}")]
    Forbidden(&'static str),
    #[error("Another flow is in progress at step {0:?}")]
    Busy(Step),
    #[error("Persistence failure: {0}")]
    Persistence(String),
    #[error("Delivery failure: {0}")]
    Delivery(String),
}

impl FlowError {
    pub fn user_message(&self) -> String {
        match self {
            FlowError::Validation(reason) => reason.clone(),
            FlowError::DuplicateRequest => {
                "⏳ You already have a registration request under review.".to_string()
            }
            FlowError::NotFound(what) => format!("❌ Not found: {what}."),
            FlowError::InvalidState(reason) => format!("⚠️ {reason}"),
            FlowError::Forbidden(what) => format!("⛔ This command requires {what}."),
            FlowError::Busy(_) => {
                "⚠️ Please finish the current form or send /cancel first.".to_string()
            }
            FlowError::Persistence(_) => {
                "❌ Could not save right now. Please send your last answer again.".to_string()
            }
            FlowError::Delivery(_) => "⚠️ A message could not be delivered.".to_string(),
        }
    }

    /// Errors after which the flow is abandoned rather than retried
    pub fn clears_flow(&self) -> bool {
        matches!(
            self,
            FlowError::DuplicateRequest | FlowError::NotFound(_) | FlowError::InvalidState(_)
        )
    }
}

impl From<DbError> for FlowError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound { entity, id } => FlowError::NotFound(format!("{entity} #{id}")),
            DbError::InvalidState(reason) => FlowError::InvalidState(reason),
            DbError::DuplicateRequest(_) => FlowError::DuplicateRequest,
            DbError::Sqlite(_) | DbError::Timeout(_) | DbError::Join(_) => {
                FlowError::Persistence(e.to_string())
            }
        }
    }
}

impl From<TransitionError> for FlowError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::Validation(reason) => FlowError::Validation(reason),
            TransitionError::Busy(step) => FlowError::Busy(step),
            TransitionError::NoActiveFlow => {
                FlowError::InvalidState("No form is in progress.".to_string())
            }
            TransitionError::InvalidTransition(reason) => FlowError::InvalidState(reason),
        }
    }
}

impl From<DeliveryError> for FlowError {
    fn from(e: DeliveryError) -> Self {
        FlowError::Delivery(e.to_string())
    }
}
