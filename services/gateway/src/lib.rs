pub mod http;
pub mod orchestrator;
pub mod state;
pub mod streams;
pub mod worker;

pub use state::AppState;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::watch;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/api/user/sse/connect", get(http::sse::connect))
        .route("/api/user/sse/disconnect", post(http::sse::disconnect))
        .route("/api/user/sse/stats", get(http::sse::stats))
        .route("/api/user/sse/connected/:user_id", get(http::sse::connected))
        .route("/api/user/messages", get(http::messages::list_messages))
        .route("/api/user/messages/read", post(http::messages::mark_read))
        .route(
            "/api/user/messages/read-all",
            post(http::messages::mark_all_read),
        )
        .with_state(state)
}

/// Spawn the delivery pipeline of this pod: orchestrator consumer, grid
/// observer, heartbeat ticker.
pub fn spawn_pipeline(state: &AppState, shutdown: watch::Receiver<bool>) {
    let orchestrator = Arc::new(orchestrator::Orchestrator::new(
        state.store.clone(),
        state.grid.clone(),
        state.log.clone(),
        state.directory.clone(),
        state.settings.clone(),
    ));
    tokio::spawn(orchestrator.run(shutdown.clone()));

    let worker = Arc::new(worker::DeliveryWorker::new(
        state.store.clone(),
        state.grid.clone(),
        state.streams.clone(),
    ));
    tokio::spawn(worker.run(shutdown.clone()));

    tokio::spawn(worker::run_heartbeat_loop(
        state.streams.clone(),
        state.grid.clone(),
        state.settings.clone(),
        shutdown,
    ));
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
