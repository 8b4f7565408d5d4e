//! HTTP API: Axum server exposing registration, cycle control, schedule
//! management and history.
//!
//! CORS is open for the local dashboard and tooling.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

pub use routes::{AppState, CoordinatorState};

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        // Registry
        .route("/register", post(routes::register))
        .route("/register_service", post(routes::register))
        .route("/force_register_all", post(routes::force_register_all))
        .route("/service_status", get(routes::service_status))
        // Cycles
        .route("/start_trading_cycle", post(routes::start_trading_cycle))
        .route("/trading_cycles", get(routes::trading_cycles))
        .route("/latest_cycle", get(routes::latest_cycle))
        .route("/workflow/stats", get(routes::workflow_stats))
        .route("/workflow/:cycle_id", get(routes::workflow_detail))
        // Schedule
        .route("/schedule/status", get(routes::get_schedule))
        .route(
            "/schedule/config",
            get(routes::get_schedule).post(routes::update_schedule),
        )
        .route("/schedule/enable", post(routes::enable_schedule))
        .route("/schedule/disable", post(routes::disable_schedule))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr().context("API listener has no address")?;
    info!(%addr, "API server listening on http://{addr}");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
