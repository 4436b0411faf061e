//! HTTP request handlers

use super::types::{ErrorResponse, EventResponse, HealthResponse};
use super::AppState;
use crate::router::InboundEvent;
use crate::runtime::EntityStore;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/events", post(receive_event))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================
// Inbound Events
// ============================================================

async fn receive_event(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> Result<Json<EventResponse>, AppError> {
    if let InboundEvent::Command { name, .. } = &event {
        if name.trim_start_matches('/').is_empty() {
            return Err(AppError::BadRequest("Command name is empty".to_string()));
        }
    }
    let replies = state.router.handle(event).await;
    Ok(Json(EventResponse { replies }))
}

// ============================================================
// Health
// ============================================================

/// Reports healthy only while the store answers
async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    state
        .router
        .engine()
        .store()
        .list_admins()
        .await
        .map_err(|e| AppError::Unavailable(e.to_string()))?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

// ============================================================
// Error Handling
// ============================================================

enum AppError {
    BadRequest(String),
    Unavailable(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unavailable(msg) => {
                tracing::warn!(error = %msg, "Health check failed");
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
