use std::sync::Arc;
use std::time::Duration;

use beacon_core::config::Settings;
use beacon_core::directory::UserDirectory;
use beacon_core::grid::GridCache;
use beacon_core::log::EventLog;
use beacon_core::registry::ConnectionRegistry;
use beacon_core::store::BroadcastStore;
use beacon_core::throttle::RateLimiter;

use crate::dlt::DltManager;
use crate::lifecycle::LifecycleManager;
use crate::targeting::TargetingEngine;

/// Creates per minute before the admin API starts returning 429.
const CREATE_RATE_LIMIT: u32 = 60;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BroadcastStore>,
    pub log: Arc<dyn EventLog>,
    pub grid: Arc<dyn GridCache>,
    pub directory: Arc<dyn UserDirectory>,
    pub settings: Arc<Settings>,
    pub lifecycle: Arc<LifecycleManager>,
    pub dlt: Arc<DltManager>,
    pub registry: Arc<ConnectionRegistry>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn BroadcastStore>,
        log: Arc<dyn EventLog>,
        grid: Arc<dyn GridCache>,
        directory: Arc<dyn UserDirectory>,
        settings: Arc<Settings>,
    ) -> Self {
        let targeting =
            TargetingEngine::new(store.clone(), directory.clone(), settings.db_batch_size);
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            targeting,
            settings.clone(),
        ));
        let dlt = Arc::new(DltManager::new(store.clone(), log.clone()));
        let registry = Arc::new(ConnectionRegistry::new(
            grid.clone(),
            settings.sse_max_connections_per_user,
            &settings.pod_id,
            &settings.cluster_name,
        ));
        AppState {
            store,
            log,
            grid,
            directory,
            settings,
            lifecycle,
            dlt,
            registry,
            limiter: Arc::new(RateLimiter::new(CREATE_RATE_LIMIT, Duration::from_secs(60))),
        }
    }
}
