use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use reviewd_server::config::Config;
use reviewd_server::db::SqliteDb;
use reviewd_server::gitlab::HttpProviderFactory;
use reviewd_server::orchestrator::{Deps, DEFAULT_DEBOUNCE_WINDOW};
use reviewd_server::reviewer::HttpReviewer;
use reviewd_server::runtime::{Dispatcher, RetryPolicy, Runtime};
use reviewd_server::webhook::webhook_router;
use reviewd_server::{admin::admin_router, AppState};

async fn healthz() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "reviewd",
        "version": reviewd_core::get_service_version(),
    })))
}

/// Graceful shutdown on Ctrl+C / SIGTERM.
async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        eprintln!("failed to listen for shutdown signal: {e}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting reviewd");

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    let db_path = config.database_path.clone();
    info!("Using database: {}", db_path.display());
    let db = tokio::task::spawn_blocking(move || SqliteDb::new(&db_path))
        .await
        .context("spawn_blocking panicked")?
        .context("Failed to open database")?;
    let db = Arc::new(db);

    let providers: Arc<dyn reviewd_server::gitlab::ProviderFactory> =
        Arc::new(HttpProviderFactory::new()?);
    let reviewer = Arc::new(HttpReviewer::new(
        &config.reviewer_url,
        config.review_model.clone(),
        config.max_tokens,
    )?);

    let deps = Arc::new(Deps {
        db: db.clone(),
        encryption_key: config.encryption_key.clone(),
        providers: providers.clone(),
        reviewer,
        debounce_window: DEFAULT_DEBOUNCE_WINDOW,
    });

    let runtime = Arc::new(Runtime::new(db.clone(), deps, RetryPolicy::default()));

    // Re-spawn invocations that were in flight when the process last stopped,
    // before accepting any requests.
    let recovered = runtime.recover().await?;
    if recovered > 0 {
        info!("Resumed {} interrupted review orchestrations", recovered);
    }

    let dispatcher: Arc<dyn Dispatcher> = runtime;
    let app_state = Arc::new(AppState {
        db,
        dispatcher,
        providers,
        encryption_key: config.encryption_key.clone(),
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .merge(webhook_router())
        .merge(admin_router())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("Server listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}
