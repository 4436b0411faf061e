//! HTTP API
//!
//! The messaging transport posts inbound events here; replies leave through
//! the configured messenger.

mod handlers;
mod types;

pub use handlers::create_router;

use crate::router::CommandRouter;
use crate::runtime::{DatabaseStore, Messenger};
use std::sync::Arc;

pub type ProductionRouter = CommandRouter<DatabaseStore, dyn Messenger>;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ProductionRouter>,
}

impl AppState {
    pub fn new(router: ProductionRouter) -> Self {
        Self {
            router: Arc::new(router),
        }
    }
}
