//! API request and response types

use serde::Serialize;

/// Response for an accepted inbound event
#[derive(Debug, Serialize)]
pub struct EventResponse {
    /// Messages the router sent directly (views, hints, errors)
    pub replies: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
