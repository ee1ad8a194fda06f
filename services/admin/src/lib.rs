pub mod dlt;
pub mod http;
pub mod lifecycle;
pub mod outbox;
pub mod scheduler;
pub mod state;
pub mod targeting;

pub use state::AppState;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio::sync::watch;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route(
            "/api/admin/broadcasts",
            get(http::broadcasts::list_broadcasts).post(http::broadcasts::create_broadcast),
        )
        .route(
            "/api/admin/broadcasts/users/all-ids",
            get(http::broadcasts::all_user_ids),
        )
        .route(
            "/api/admin/broadcasts/:id",
            get(http::broadcasts::get_broadcast).delete(http::broadcasts::delete_broadcast),
        )
        .route(
            "/api/admin/broadcasts/:id/stats",
            get(http::broadcasts::get_broadcast_stats),
        )
        .route(
            "/api/admin/broadcasts/:id/deliveries",
            get(http::broadcasts::list_deliveries),
        )
        .route("/api/admin/dlt/messages", get(http::dlt::list_messages))
        .route("/api/admin/dlt/redrive/:id", post(http::dlt::redrive_one))
        .route("/api/admin/dlt/redrive-all", post(http::dlt::redrive_all))
        .route("/api/admin/dlt/purge/:id", delete(http::dlt::purge_one))
        .route("/api/admin/dlt/purge-all", delete(http::dlt::purge_all))
        .with_state(state)
}

/// Spawn the leader-leased background loops: outbox poller, precompute,
/// activation, expiration, stale-reap.  All stop when `shutdown` flips.
pub fn spawn_background_loops(state: &AppState, shutdown: watch::Receiver<bool>) {
    let settings = state.settings.clone();
    let holder = settings.pod_id.clone();

    {
        let poller = Arc::new(outbox::OutboxPoller::new(
            state.store.clone(),
            state.log.clone(),
            settings.outbox_batch_size,
            settings.publish_timeout,
        ));
        let store = state.store.clone();
        let shutdown = shutdown.clone();
        let holder = holder.clone();
        let interval = settings.outbox_poll_interval;
        let lease_ttl = settings.lease_ttl;
        tokio::spawn(async move {
            scheduler::run_leased_loop(
                "outbox-poller",
                interval,
                lease_ttl,
                store,
                holder,
                shutdown,
                move || {
                    let poller = poller.clone();
                    async move { poller.tick().await.map(|_| ()) }
                },
            )
            .await;
        });
    }

    spawn_lifecycle_loop(state, shutdown.clone(), "precompute", |lifecycle| async move {
        lifecycle.precompute_due(chrono::Utc::now()).await
    });
    spawn_lifecycle_loop(state, shutdown.clone(), "activation", |lifecycle| async move {
        lifecycle.activate_due(chrono::Utc::now()).await
    });
    spawn_lifecycle_loop(state, shutdown.clone(), "expiration", |lifecycle| async move {
        lifecycle.expire_due(chrono::Utc::now()).await
    });

    {
        let registry = state.registry.clone();
        let store = state.store.clone();
        let threshold = settings.sse_client_timeout_threshold;
        let interval = settings.scheduler_interval.min(Duration::from_secs(60));
        let lease_ttl = settings.lease_ttl;
        tokio::spawn(async move {
            scheduler::run_leased_loop(
                "stale-reap",
                interval,
                lease_ttl,
                store,
                holder,
                shutdown,
                move || {
                    let registry = registry.clone();
                    async move {
                        registry.reap_stale(threshold, chrono::Utc::now()).await?;
                        Ok(())
                    }
                },
            )
            .await;
        });
    }
}

fn spawn_lifecycle_loop<F, Fut>(
    state: &AppState,
    shutdown: watch::Receiver<bool>,
    name: &'static str,
    tick: F,
) where
    F: Fn(Arc<lifecycle::LifecycleManager>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = beacon_core::CoreResult<()>> + Send + 'static,
{
    let lifecycle = state.lifecycle.clone();
    let store = state.store.clone();
    let holder = state.settings.pod_id.clone();
    let interval = state.settings.scheduler_interval;
    let lease_ttl = state.settings.lease_ttl;
    tokio::spawn(async move {
        scheduler::run_leased_loop(name, interval, lease_ttl, store, holder, shutdown, move || {
            tick(lifecycle.clone())
        })
        .await;
    });
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
