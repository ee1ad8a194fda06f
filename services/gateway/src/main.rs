use std::env;
use std::sync::Arc;

use beacon_core::config::Settings;
use beacon_core::directory::StaticDirectory;
use beacon_core::grid::memory::MemoryGrid;
use beacon_core::log::memory::MemoryLog;
use beacon_protocol::StreamFrame;
use gateway::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let settings = match Settings::from_env() {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };
    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8081".to_owned());

    info!("connecting to database...");
    let pool = beacon_store::create_pool(&database_url).await;
    beacon_store::run_migrations(&pool).await;
    info!("migrations applied");

    // Single-node grid/log backends; clustered engines plug in behind the
    // same traits at deployment time.
    let store = Arc::new(beacon_store::PgStore::new(pool));
    let grid = Arc::new(MemoryGrid::new());
    let log = Arc::new(MemoryLog::new());
    let directory = Arc::new(StaticDirectory::new());

    let state = AppState::new(store, grid, log, directory, settings);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    gateway::spawn_pipeline(&state, shutdown_rx);

    let router = gateway::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, pod_id = %state.settings.pod_id, "gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Graceful drain: no new streams are being accepted; tell every open
    // stream, close them, and stop the pipeline loops.
    let _ = shutdown_tx.send(true);
    state
        .streams
        .broadcast_frame(&StreamFrame::ServerShutdown)
        .await;
    state.streams.clear().await;
    info!("gateway shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
