//! Connection-registry operations over the grid.
//!
//! Register, heartbeat, unregister and the stale reaper — all expressed as
//! CAS loops with a bounded retry budget.  Heartbeat writes may reorder
//! against registrations; staleness is evaluated monotonically so that is
//! harmless.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::grid::{ConnectionInfo, GridCache, HeartbeatEntry};

const CAS_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    /// The per-user cap is already filled; nothing was written.
    LimitReached,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    grid: Arc<dyn GridCache>,
    max_per_user: usize,
    pod_id: String,
    cluster_id: String,
}

impl ConnectionRegistry {
    pub fn new(grid: Arc<dyn GridCache>, max_per_user: u32, pod_id: &str, cluster_id: &str) -> Self {
        ConnectionRegistry {
            grid,
            max_per_user: max_per_user.max(1) as usize,
            pod_id: pod_id.to_owned(),
            cluster_id: cluster_id.to_owned(),
        }
    }

    pub fn max_per_user(&self) -> u32 {
        self.max_per_user as u32
    }

    /// Register a connection, enforcing the per-user cap.
    ///
    /// Re-registering an existing `(user, connection)` pair refreshes its
    /// activity timestamp and never counts against the cap.
    pub async fn register(
        &self,
        user_id: &str,
        connection_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<RegisterOutcome> {
        for attempt in 0..CAS_RETRIES {
            let current = self.grid.user_connections(user_id).await?;
            let (version, mut connections) = match current {
                Some(v) => (Some(v.version), v.connections),
                None => (None, std::collections::HashMap::new()),
            };

            if connections.len() >= self.max_per_user && !connections.contains_key(connection_id) {
                debug!(user_id, connection_id, "connection cap reached");
                return Ok(RegisterOutcome::LimitReached);
            }

            connections.insert(
                connection_id.to_owned(),
                ConnectionInfo {
                    pod_id: self.pod_id.clone(),
                    cluster_id: self.cluster_id.clone(),
                    connected_at: now,
                    last_activity_at: now,
                },
            );

            if self
                .grid
                .cas_user_connections(user_id, version, connections)
                .await?
            {
                self.grid
                    .put_heartbeat(
                        connection_id,
                        HeartbeatEntry {
                            user_id: user_id.to_owned(),
                            last_heartbeat_epoch: now.timestamp(),
                        },
                    )
                    .await?;
                info!(user_id, connection_id, "connection registered");
                return Ok(RegisterOutcome::Registered);
            }
            debug!(user_id, connection_id, attempt, "register CAS retry");
        }
        Err(CoreError::CasConflict(format!(
            "register {user_id}/{connection_id} lost {CAS_RETRIES} races"
        )))
    }

    /// Bump heartbeat epochs for live connections.  Idempotent.
    pub async fn heartbeat(&self, connection_ids: &[String], now: DateTime<Utc>) -> CoreResult<()> {
        self.grid
            .bump_heartbeats(connection_ids, now.timestamp())
            .await
    }

    /// Remove a connection; drops the user entry when it was the last one.
    pub async fn unregister(&self, user_id: &str, connection_id: &str) -> CoreResult<()> {
        for attempt in 0..CAS_RETRIES {
            let Some(current) = self.grid.user_connections(user_id).await? else {
                self.grid.remove_heartbeat(connection_id).await?;
                return Ok(());
            };
            let mut connections = current.connections;
            if connections.remove(connection_id).is_none() {
                self.grid.remove_heartbeat(connection_id).await?;
                return Ok(());
            }
            if self
                .grid
                .cas_user_connections(user_id, Some(current.version), connections)
                .await?
            {
                self.grid.remove_heartbeat(connection_id).await?;
                info!(user_id, connection_id, "connection unregistered");
                return Ok(());
            }
            debug!(user_id, connection_id, attempt, "unregister CAS retry");
        }
        Err(CoreError::CasConflict(format!(
            "unregister {user_id}/{connection_id} lost {CAS_RETRIES} races"
        )))
    }

    /// Unregister every connection whose heartbeat is older than `threshold`.
    /// Returns the reaped `(connection_id, user_id)` pairs.
    pub async fn reap_stale(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<(String, String)>> {
        let cutoff = now.timestamp() - threshold.as_secs() as i64;
        let stale = self.grid.stale_connections(cutoff).await?;
        let mut reaped = Vec::with_capacity(stale.len());
        for (connection_id, user_id) in stale {
            match self.unregister(&user_id, &connection_id).await {
                Ok(()) => {
                    warn!(user_id = %user_id, connection_id = %connection_id, "reaped stale connection");
                    reaped.push((connection_id, user_id));
                }
                Err(e) if e.is_retryable() => {
                    // Next reaper tick picks it up again.
                    warn!(user_id = %user_id, connection_id = %connection_id, error = %e, "stale reap deferred");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }

    pub async fn is_online(&self, user_id: &str) -> CoreResult<bool> {
        Ok(self
            .grid
            .user_connections(user_id)
            .await?
            .is_some_and(|v| !v.connections.is_empty()))
    }

    pub async fn connections_of(&self, user_id: &str) -> CoreResult<Vec<String>> {
        Ok(self
            .grid
            .user_connections(user_id)
            .await?
            .map(|v| v.connections.keys().cloned().collect())
            .unwrap_or_default())
    }
}
