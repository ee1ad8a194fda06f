//! Distributed in-memory grid interface.
//!
//! The grid holds the connection registry, heartbeats, per-user inboxes, the
//! hot broadcast-content cache and the pending-event queues.  All keys are
//! cluster-scoped; `pod_id` is data on a connection, never part of a key, so
//! a pod restart loses no state.
//!
//! Multi-field values (a user's connection map) are updated with
//! compare-and-set: readers get a version, writers pass it back.  Inbox
//! mutations additionally fan out [`GridEvent`]s to continuous-query
//! subscribers (the delivery workers).

use std::collections::HashMap;

use async_trait::async_trait;
use beacon_protocol::{
    Broadcast, DeliveryStatus, MessageDeliveryEvent, ReadStatus, RemovalReason,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::CoreResult;

pub mod memory;

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub pod_id: String,
    pub cluster_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// A user's connection map plus the CAS version it was read at.
#[derive(Debug, Clone)]
pub struct VersionedConnections {
    pub version: u64,
    pub connections: HashMap<String, ConnectionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatEntry {
    pub user_id: String,
    pub last_heartbeat_epoch: i64,
}

/// One entry in a user's grid inbox, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct InboxEntry {
    pub entry_id: Uuid,
    pub broadcast_id: Uuid,
    pub delivery_status: DeliveryStatus,
    pub read_status: ReadStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridEventKind {
    Message,
    ReadReceipt,
    MessageRemoved,
}

/// Continuous-query notification emitted on inbox mutations.
#[derive(Debug, Clone)]
pub struct GridEvent {
    pub user_id: String,
    pub broadcast_id: Uuid,
    pub kind: GridEventKind,
    /// Present only for `MessageRemoved`.
    pub removal_reason: Option<RemovalReason>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait GridCache: Send + Sync {
    // --- connection registry ---------------------------------------------

    async fn user_connections(&self, user_id: &str) -> CoreResult<Option<VersionedConnections>>;

    /// Compare-and-set the user's connection map.  `expected_version` of
    /// `None` is put-if-absent; an empty map removes the user entry.
    /// `Ok(false)` signals a lost race — re-read and retry.
    async fn cas_user_connections(
        &self,
        user_id: &str,
        expected_version: Option<u64>,
        connections: HashMap<String, ConnectionInfo>,
    ) -> CoreResult<bool>;

    /// Users with at least one live connection on this cluster.
    async fn online_users(&self) -> CoreResult<Vec<String>>;

    /// `(online users, open connections)`.
    async fn connection_counts(&self) -> CoreResult<(usize, usize)>;

    // --- heartbeats -------------------------------------------------------

    async fn heartbeat(&self, connection_id: &str) -> CoreResult<Option<HeartbeatEntry>>;
    async fn put_heartbeat(&self, connection_id: &str, entry: HeartbeatEntry) -> CoreResult<()>;
    async fn remove_heartbeat(&self, connection_id: &str) -> CoreResult<()>;

    /// Bump `last_heartbeat_epoch` for each id; missing ids are skipped.
    async fn bump_heartbeats(&self, connection_ids: &[String], epoch: i64) -> CoreResult<()>;

    /// Connections whose heartbeat epoch is strictly below `cutoff_epoch`,
    /// as `(connection_id, user_id)`.
    async fn stale_connections(&self, cutoff_epoch: i64) -> CoreResult<Vec<(String, String)>>;

    // --- user inboxes -----------------------------------------------------

    /// Prepend an entry and notify watchers with a `Message` event.
    async fn push_inbox(&self, user_id: &str, entry: InboxEntry) -> CoreResult<()>;

    /// Flip the entry to read and notify watchers with a `ReadReceipt`.
    async fn mark_inbox_read(&self, user_id: &str, broadcast_id: Uuid) -> CoreResult<()>;

    /// Drop the entry and notify watchers with a `MessageRemoved`.
    async fn remove_inbox(
        &self,
        user_id: &str,
        broadcast_id: Uuid,
        reason: RemovalReason,
    ) -> CoreResult<()>;

    async fn read_inbox(&self, user_id: &str, limit: usize) -> CoreResult<Vec<InboxEntry>>;

    /// Drop the cached inbox so the next read rebuilds from the store.
    async fn evict_inbox(&self, user_id: &str) -> CoreResult<()>;

    // --- broadcast content cache -----------------------------------------

    async fn cache_broadcast(&self, broadcast: Broadcast) -> CoreResult<()>;
    async fn cached_broadcast(&self, id: Uuid) -> CoreResult<Option<Broadcast>>;
    async fn evict_broadcast(&self, id: Uuid) -> CoreResult<()>;

    // --- pending events (offline users) ----------------------------------

    async fn enqueue_pending(
        &self,
        user_id: &str,
        event: MessageDeliveryEvent,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<()>;

    /// Take every still-live pending event for the user, oldest first.
    async fn drain_pending(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<MessageDeliveryEvent>>;

    // --- continuous query -------------------------------------------------

    /// Subscribe to inbox mutation events (the worker's continuous query).
    fn watch_events(&self) -> broadcast::Receiver<GridEvent>;
}
