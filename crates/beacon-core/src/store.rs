//! Durable store interface.
//!
//! Every mutating operation that must also emit events takes those events as
//! part of its signature and applies both in one transaction — there is no
//! standalone "emit" method, so writing an event outside a business
//! transaction is unrepresentable.  Backends: Postgres (`beacon-store`) and
//! the in-memory store in [`memory`].

use async_trait::async_trait;
use beacon_protocol::{
    Broadcast, BroadcastStatus, DeliveryEventType, DeliveryStatus, Priority, ReadStatus,
    TargetSpec,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreResult;

pub mod memory;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Input for broadcast creation.  The caller assigns the id so events that
/// reference the broadcast can ride the same transaction; status and
/// timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewBroadcast {
    pub id: Uuid,
    pub sender: String,
    pub content: String,
    pub priority: Priority,
    pub category: Option<String>,
    pub target: TargetSpec,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub fire_and_forget: bool,
}

/// One `(broadcast, user)` delivery row.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRow {
    pub broadcast_id: Uuid,
    pub user_id: String,
    pub delivery_status: DeliveryStatus,
    pub read_status: ReadStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub total_targeted: i64,
    pub total_delivered: i64,
    pub total_read: i64,
    pub total_failed: i64,
}

/// An unpublished outbox row.  Rows only exist unpublished; a successful
/// publish deletes them.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: Uuid,
    /// Routing key on the log (user id or broadcast id).
    pub aggregate_id: String,
    pub event_type: String,
    pub topic: String,
    /// Serialized `MessageDeliveryEvent` JSON.
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// What a caller hands a mutating operation for atomic emission.
#[derive(Debug, Clone)]
pub struct OutboxInsert {
    pub aggregate_id: String,
    pub event_type: String,
    pub topic: String,
    pub payload: String,
}

impl OutboxInsert {
    /// Standard conversion from a delivery event (topic supplied by caller).
    pub fn from_event(event: &beacon_protocol::MessageDeliveryEvent, topic: &str) -> Self {
        OutboxInsert {
            aggregate_id: event.routing_key(),
            event_type: format!("{:?}", event.event_type).to_uppercase(),
            topic: topic.to_owned(),
            payload: serde_json::to_string(event).expect("delivery event serializes"),
        }
    }
}

/// Per-user lifecycle event emitted by the `supersede`/`activate` paths.
/// Both store backends build these inside their transactions.
pub fn lifecycle_outbox_insert(
    broadcast: &Broadcast,
    user_id: &str,
    event_type: DeliveryEventType,
    topic: &str,
    now: DateTime<Utc>,
) -> OutboxInsert {
    OutboxInsert::from_event(
        &beacon_protocol::MessageDeliveryEvent {
            event_id: Uuid::new_v4(),
            broadcast_id: broadcast.id,
            user_id: Some(user_id.to_owned()),
            event_type,
            timestamp: now,
            message: None,
            fire_and_forget: broadcast.fire_and_forget,
            transient_failure: false,
        },
        topic,
    )
}

/// Where drained outbox rows go: an adapter over the log publisher.
#[async_trait]
pub trait OutboxSink: Send + Sync {
    /// Publish one event and wait for the broker acknowledgment.
    async fn publish(&self, event: &OutboxEvent) -> CoreResult<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxDrain {
    pub published: u64,
    pub quarantined: u64,
}

/// A quarantined event that exceeded the consumer retry budget.
#[derive(Debug, Clone)]
pub struct DltRecord {
    pub id: Uuid,
    pub original_topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: String,
    pub fail_title: String,
    pub fail_detail: String,
    pub payload: Vec<u8>,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastFilter {
    All,
    Active,
    Scheduled,
}

/// A user's view of one delivered (or deliverable) broadcast.
#[derive(Debug, Clone)]
pub struct UserMessage {
    pub broadcast: Broadcast,
    pub delivery_status: DeliveryStatus,
    pub read_status: ReadStatus,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BroadcastStore: Send + Sync {
    // --- broadcasts -------------------------------------------------------

    /// Insert a broadcast in `status`, emitting `events` in the same
    /// transaction.
    async fn insert_broadcast(
        &self,
        new: NewBroadcast,
        status: BroadcastStatus,
        events: &[OutboxInsert],
    ) -> CoreResult<Broadcast>;

    async fn broadcast(&self, id: Uuid) -> CoreResult<Option<Broadcast>>;

    /// Newest first, capped by `limit`.
    async fn list_broadcasts(
        &self,
        filter: BroadcastFilter,
        limit: i64,
    ) -> CoreResult<Vec<Broadcast>>;

    /// Atomic status transition gated on the current status being in `from`;
    /// `events` are emitted in the same transaction.  `Ok(false)` means the
    /// gate did not match and nothing was written.
    async fn transition(
        &self,
        id: Uuid,
        from: &[BroadcastStatus],
        to: BroadcastStatus,
        events: &[OutboxInsert],
    ) -> CoreResult<bool>;

    /// `READY -> ACTIVE` for a write-fanout broadcast, emitting one `CREATED`
    /// event per pending delivery row (keyed by user).  Returns the number of
    /// events emitted, or `None` if the broadcast was not `READY`.
    async fn activate_precomputed(&self, id: Uuid, topic: &str) -> CoreResult<Option<u64>>;

    /// Terminal flip (`CANCELLED` or `EXPIRED`): sets the status, moves every
    /// non-terminal delivery row to `SUPERSEDED`, and emits one lifecycle
    /// event per affected user — all in one transaction.  Returns the number
    /// of superseded rows, or `None` if the broadcast was already terminal
    /// (cancel) / not `ACTIVE` (expire).
    async fn supersede(
        &self,
        id: Uuid,
        to: BroadcastStatus,
        event_type: DeliveryEventType,
        topic: &str,
    ) -> CoreResult<Option<u64>>;

    /// `SCHEDULED` broadcasts whose `scheduled_at <= now`, split by fan-out
    /// mode.
    async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        fan_out_on_write: bool,
        limit: i64,
    ) -> CoreResult<Vec<Broadcast>>;

    async fn ready_broadcasts(&self, limit: i64) -> CoreResult<Vec<Broadcast>>;

    /// `ACTIVE` broadcasts whose `expires_at <= now`.
    async fn expired_active(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Broadcast>>;

    // --- deliveries & statistics -----------------------------------------

    /// Insert `PENDING` rows for `user_ids`, skipping rows that already
    /// exist, and add the newly inserted count to `total_targeted`.  Returns
    /// the newly inserted count; re-running is a no-op.
    async fn insert_delivery_batch(
        &self,
        broadcast_id: Uuid,
        user_ids: &[String],
    ) -> CoreResult<u64>;

    /// `PENDING -> DELIVERED` plus `total_delivered`, atomically.  `false`
    /// when the row was not pending (idempotent re-delivery).
    async fn mark_delivered(&self, broadcast_id: Uuid, user_id: &str) -> CoreResult<bool>;

    /// `PENDING -> FAILED` plus `total_failed`.
    async fn mark_delivery_failed(&self, broadcast_id: Uuid, user_id: &str) -> CoreResult<bool>;

    /// `UNREAD -> READ` plus `total_read`, emitting `events` in the same
    /// transaction.  `false` when already read (no events written).
    async fn mark_read(
        &self,
        broadcast_id: Uuid,
        user_id: &str,
        events: &[OutboxInsert],
    ) -> CoreResult<bool>;

    /// All unread rows for a user to `READ`, emitting one `READ` event per
    /// affected broadcast in the same transaction.  Returns the affected
    /// broadcast ids.
    async fn mark_all_read(&self, user_id: &str, topic: &str) -> CoreResult<Vec<Uuid>>;

    /// DLT redrive support: reset a row to `PENDING` in its own transaction.
    async fn reset_delivery(&self, broadcast_id: Uuid, user_id: &str) -> CoreResult<bool>;

    async fn deliveries(
        &self,
        broadcast_id: Uuid,
        status: Option<DeliveryStatus>,
        limit: i64,
        offset: i64,
    ) -> CoreResult<Vec<DeliveryRow>>;

    /// Inbox read path: the user's rows joined with broadcast content,
    /// newest first.
    async fn user_messages(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: i64,
    ) -> CoreResult<Vec<UserMessage>>;

    /// Broadcasts with a `PENDING` row for this user that are still
    /// `ACTIVE` — the reconnect catch-up set.
    async fn undelivered_for_user(&self, user_id: &str) -> CoreResult<Vec<Broadcast>>;

    async fn stats(&self, broadcast_id: Uuid) -> CoreResult<BroadcastStats>;

    // --- outbox -----------------------------------------------------------

    /// Drain up to `limit` unpublished rows in insertion order: each payload
    /// is validated (a row that fails to deserialize is poison and is moved
    /// to the quarantine table instead of published), published through
    /// `sink` while the selection is held, and deleted once the whole batch
    /// acked.  A publish failure aborts the drain and leaves every row in
    /// place for the next tick.  The Postgres backend locks candidates
    /// `FOR UPDATE SKIP LOCKED` for the duration, so a lease handover
    /// mid-batch cannot double-feed.
    async fn drain_outbox(&self, limit: i64, sink: &dyn OutboxSink) -> CoreResult<OutboxDrain>;

    async fn outbox_depth(&self) -> CoreResult<i64>;

    // --- dead letters -----------------------------------------------------

    async fn insert_dlt(&self, record: DltRecord) -> CoreResult<()>;
    async fn list_dlt(&self, limit: i64) -> CoreResult<Vec<DltRecord>>;
    async fn dlt_record(&self, id: Uuid) -> CoreResult<Option<DltRecord>>;
    async fn delete_dlt(&self, id: Uuid) -> CoreResult<bool>;
    async fn purge_dlt(&self) -> CoreResult<u64>;

    // --- scheduler leases -------------------------------------------------

    /// Take or extend the named lease.  Succeeds when the lease is free,
    /// expired, or already held by `holder`.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<bool>;

    async fn release_lease(&self, name: &str, holder: &str) -> CoreResult<()>;
}
