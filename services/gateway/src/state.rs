use std::sync::Arc;
use std::time::Duration;

use beacon_core::config::Settings;
use beacon_core::directory::UserDirectory;
use beacon_core::grid::GridCache;
use beacon_core::log::EventLog;
use beacon_core::registry::ConnectionRegistry;
use beacon_core::store::BroadcastStore;
use beacon_core::throttle::RateLimiter;

use crate::streams::StreamRegistry;

/// Stream connects per user per minute.
const CONNECT_RATE_LIMIT: u32 = 30;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BroadcastStore>,
    pub grid: Arc<dyn GridCache>,
    pub log: Arc<dyn EventLog>,
    pub directory: Arc<dyn UserDirectory>,
    pub settings: Arc<Settings>,
    pub registry: Arc<ConnectionRegistry>,
    pub streams: Arc<StreamRegistry>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn BroadcastStore>,
        grid: Arc<dyn GridCache>,
        log: Arc<dyn EventLog>,
        directory: Arc<dyn UserDirectory>,
        settings: Arc<Settings>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            grid.clone(),
            settings.sse_max_connections_per_user,
            &settings.pod_id,
            &settings.cluster_name,
        ));
        let streams = Arc::new(StreamRegistry::new(
            settings.stream_queue_capacity,
            settings.stream_write_budget,
        ));
        AppState {
            store,
            grid,
            log,
            directory,
            settings,
            registry,
            streams,
            limiter: Arc::new(RateLimiter::new(
                CONNECT_RATE_LIMIT,
                Duration::from_secs(60),
            )),
        }
    }
}
