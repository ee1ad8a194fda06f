//! Periodic control loops, single-leader via store-backed leases.
//!
//! Every tick re-acquires (or extends) the named lease before doing work; a
//! process that loses the lease mid-tick is harmless because every tick
//! operation is idempotent.  Errors log with context and surrender the
//! lease so another process can take the next tick.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use beacon_core::error::CoreResult;
use beacon_core::store::BroadcastStore;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, trace};

pub async fn run_leased_loop<F, Fut>(
    name: &'static str,
    every: Duration,
    lease_ttl: Duration,
    store: Arc<dyn BroadcastStore>,
    holder: String,
    mut shutdown: watch::Receiver<bool>,
    tick_fn: F,
) where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = CoreResult<()>> + Send,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                let until = now
                    + chrono::Duration::from_std(lease_ttl)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));
                match store.try_acquire_lease(name, &holder, until, now).await {
                    Ok(true) => {
                        trace!(loop_name = name, "lease held, ticking");
                        if let Err(e) = tick_fn().await {
                            error!(loop_name = name, error = %e, "tick failed, surrendering lease");
                            let _ = store.release_lease(name, &holder).await;
                        }
                    }
                    Ok(false) => {
                        trace!(loop_name = name, "lease held elsewhere");
                    }
                    Err(e) => {
                        // Lease store unreachable: skip this tick, retry next.
                        error!(loop_name = name, error = %e, "lease acquisition failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(loop_name = name, "scheduler loop stopping");
                    let _ = store.release_lease(name, &holder).await;
                    return;
                }
            }
        }
    }
}
