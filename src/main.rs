//! Tutor Desk - conversational workflow engine for a tutoring bot
//!
//! Students register, receive assignments and submit solutions; the teacher
//! approves applicants and grades work. Every exchange is a multi-step flow
//! driven by inbound messaging events.

mod api;
mod config;
mod db;
mod files;
mod notify;
mod router;
mod runtime;
mod state_machine;

use api::{create_router, AppState};
use config::Config;
use db::Database;
use router::CommandRouter;
use runtime::{DatabaseStore, HttpMessenger, LogMessenger, Messenger, ProductionEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tutor_desk=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env()?;

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;

    // The configured admin always exists and is super admin
    db.add_admin(config.admin_id, None, &config.admin_name, true)?;
    tracing::info!(admin_id = %config.admin_id, "Primary admin bootstrapped");

    let messenger: Arc<dyn Messenger> = match &config.bot_api_url {
        Some(url) => {
            tracing::info!(url = %url, "Delivering messages through the bot API");
            Arc::new(HttpMessenger::new(url.as_str(), config.delivery_timeout)?)
        }
        None => {
            tracing::warn!("BOT_API_URL not set. Outbound messages will only be logged.");
            Arc::new(LogMessenger)
        }
    };

    let store = Arc::new(DatabaseStore::new(db, config.store_timeout));
    let engine: ProductionEngine = runtime::FlowEngine::new(store, messenger, config.admin_id);
    let state = AppState::new(CommandRouter::new(Arc::new(engine)));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state).layer(cors);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Tutor Desk listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
