//! Mostrador Server
//!
//! Retail back-office server with an offline-sync reconciliation core:
//! point-of-sale devices record changes while disconnected, push them as
//! idempotent event batches, and pull the merged server state back
//! incrementally.

use axum::Router;
use std::net::SocketAddr;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod db;
mod error;
mod routes;
mod state;
mod sync;

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mostrador_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    tracing::info!("Starting Mostrador Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Database: {}", config.database.url);

    // Initialize database
    let db_pool = db::create_pool(&config.database.url)
        .await
        .expect("Failed to initialize database");
    tracing::info!("Database initialized at {}", config.database.url);

    // Create application state
    let app_state = AppState::new(config, db_pool);

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Capture the listen port before moving state into the router
    let port = app_state.config().server.port;

    // Build router
    let app = Router::new()
        .nest("/health", routes::health::router())
        .nest("/api/sync", routes::sync::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state);

    // Start server with graceful shutdown
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Mostrador Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    tracing::info!("Server shutdown complete");
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
