//! Lifecycle manager: drives broadcasts through the state machine.
//!
//! Every transition is one atomic store call carrying its outbox events, so
//! a failed transition leaves the previous state (and no stray events)
//! behind.  Write-fanout broadcasts go through the targeting engine before
//! they can activate.

use std::sync::Arc;

use beacon_core::config::Settings;
use beacon_core::error::{CoreError, CoreResult};
use beacon_core::lifecycle::creation_status;
use beacon_core::store::{BroadcastStore, NewBroadcast, OutboxInsert};
use beacon_protocol::{
    Broadcast, BroadcastStatus, DeliveryEventType, MessageDeliveryEvent, TargetSpec,
};
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::targeting::TargetingEngine;

pub struct LifecycleManager {
    store: Arc<dyn BroadcastStore>,
    targeting: TargetingEngine,
    settings: Arc<Settings>,
}

/// One group event announces a read-fanout broadcast; the consumer resolves
/// the audience when it sees it.
fn group_created_event(broadcast: &Broadcast) -> MessageDeliveryEvent {
    MessageDeliveryEvent {
        event_id: Uuid::new_v4(),
        broadcast_id: broadcast.id,
        user_id: None,
        event_type: DeliveryEventType::Created,
        timestamp: Utc::now(),
        message: None,
        fire_and_forget: broadcast.fire_and_forget,
        transient_failure: false,
    }
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn BroadcastStore>,
        targeting: TargetingEngine,
        settings: Arc<Settings>,
    ) -> Self {
        LifecycleManager {
            store,
            targeting,
            settings,
        }
    }

    fn topic(&self) -> &str {
        &self.settings.orchestration_topic
    }

    /// Validate and store a new broadcast in its creation status.
    ///
    /// Immediate read-fanout broadcasts go straight to `ACTIVE` with one
    /// group event; immediate write-fanout broadcasts land in `PREPARING`
    /// and the caller is expected to start precompute (`spawn_precompute`).
    pub async fn create(&self, mut new: NewBroadcast) -> CoreResult<Broadcast> {
        if new.sender.trim().is_empty() {
            return Err(CoreError::Validation("sender is required".to_owned()));
        }
        if new.content.trim().is_empty() {
            return Err(CoreError::Validation("content is required".to_owned()));
        }
        if let Some(expires_at) = new.expires_at {
            if expires_at <= Utc::now() {
                return Err(CoreError::Validation(
                    "expiresAt must be in the future".to_owned(),
                ));
            }
        }
        if let TargetSpec::Selected { user_ids } = &mut new.target {
            let deduped = dedup_preserving_order(user_ids);
            if deduped.is_empty() {
                return Err(CoreError::Validation(
                    "SELECTED target requires at least one user id".to_owned(),
                ));
            }
            *user_ids = deduped;
        }

        let status = creation_status(&new.target, new.scheduled_at);
        // Immediate read-fanout: the single group event rides the creation
        // transaction; the poller takes it from there.
        let events = if status == BroadcastStatus::Active {
            vec![OutboxInsert::from_event(
                &MessageDeliveryEvent {
                    event_id: Uuid::new_v4(),
                    broadcast_id: new.id,
                    user_id: None,
                    event_type: DeliveryEventType::Created,
                    timestamp: Utc::now(),
                    message: None,
                    fire_and_forget: new.fire_and_forget,
                    transient_failure: false,
                },
                self.topic(),
            )]
        } else {
            Vec::new()
        };
        let broadcast = self.store.insert_broadcast(new, status, &events).await?;

        info!(
            broadcast_id = %broadcast.id,
            status = broadcast.status.as_str(),
            "broadcast created"
        );
        Ok(broadcast)
    }

    /// Kick precompute for a freshly created `PREPARING` broadcast on a
    /// background task.
    pub fn spawn_precompute(self: &Arc<Self>, broadcast: Broadcast) {
        if broadcast.status != BroadcastStatus::Preparing {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.precompute(&broadcast).await {
                error!(broadcast_id = %broadcast.id, error = %e, "precompute failed");
            }
        });
    }

    /// Resolve the audience, write delivery rows in batches, and move the
    /// broadcast `PREPARING -> READY`.
    ///
    /// Idempotent: rerunning after a crash re-inserts nothing and ends in
    /// the same state.  Non-recoverable targeting errors park the broadcast
    /// in `FAILED`; retryable infrastructure errors leave it `PREPARING` for
    /// the next scheduler pass.
    pub async fn precompute(&self, broadcast: &Broadcast) -> CoreResult<u64> {
        let targeted = match self.targeting.precompute(broadcast).await {
            Ok(count) => count,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                warn!(broadcast_id = %broadcast.id, error = %e, "targeting is non-recoverable");
                self.store
                    .transition(
                        broadcast.id,
                        &[BroadcastStatus::Preparing, BroadcastStatus::Ready],
                        BroadcastStatus::Failed,
                        &[],
                    )
                    .await?;
                return Err(e);
            }
        };

        self.store
            .transition(
                broadcast.id,
                &[BroadcastStatus::Preparing],
                BroadcastStatus::Ready,
                &[],
            )
            .await?;
        info!(broadcast_id = %broadcast.id, targeted, "precompute complete");
        Ok(targeted)
    }

    /// Cancel: any non-terminal broadcast; supersedes pending rows and emits
    /// one `CANCELLED` event per targeted user.  `Ok(false)` when the
    /// broadcast is already terminal.
    pub async fn cancel(&self, id: Uuid) -> CoreResult<bool> {
        match self
            .store
            .supersede(
                id,
                BroadcastStatus::Cancelled,
                DeliveryEventType::Cancelled,
                self.topic(),
            )
            .await?
        {
            Some(superseded) => {
                info!(broadcast_id = %id, superseded, "broadcast cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Expire: `ACTIVE -> EXPIRED` with the same row treatment as cancel.
    pub async fn expire(&self, id: Uuid) -> CoreResult<bool> {
        match self
            .store
            .supersede(
                id,
                BroadcastStatus::Expired,
                DeliveryEventType::Expired,
                self.topic(),
            )
            .await?
        {
            Some(superseded) => {
                info!(broadcast_id = %id, superseded, "broadcast expired");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Precompute tick: due `SCHEDULED` write-fanout broadcasts move to
    /// `PREPARING` and start targeting.  One broken broadcast never blocks
    /// the rest of the batch.
    pub async fn precompute_due(&self, now: DateTime<Utc>) -> CoreResult<()> {
        let due = self.store.due_scheduled(now, true, 100).await?;
        for mut broadcast in due {
            if self
                .store
                .transition(
                    broadcast.id,
                    &[BroadcastStatus::Scheduled],
                    BroadcastStatus::Preparing,
                    &[],
                )
                .await?
            {
                broadcast.status = BroadcastStatus::Preparing;
                if let Err(e) = self.precompute(&broadcast).await {
                    error!(broadcast_id = %broadcast.id, error = %e, "precompute failed");
                }
            }
        }
        Ok(())
    }

    /// Activation tick: `READY` broadcasts emit their per-user events; due
    /// `SCHEDULED` read-fanout broadcasts emit one group event.
    pub async fn activate_due(&self, now: DateTime<Utc>) -> CoreResult<()> {
        for broadcast in self.store.ready_broadcasts(100).await? {
            if let Some(emitted) = self
                .store
                .activate_precomputed(broadcast.id, self.topic())
                .await?
            {
                info!(broadcast_id = %broadcast.id, emitted, "write-fanout broadcast activated");
            }
        }

        for broadcast in self.store.due_scheduled(now, false, 100).await? {
            let event =
                OutboxInsert::from_event(&group_created_event(&broadcast), self.topic());
            if self
                .store
                .transition(
                    broadcast.id,
                    &[BroadcastStatus::Scheduled],
                    BroadcastStatus::Active,
                    std::slice::from_ref(&event),
                )
                .await?
            {
                info!(broadcast_id = %broadcast.id, "scheduled broadcast activated");
            }
        }
        Ok(())
    }

    /// Expiration tick.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> CoreResult<()> {
        for broadcast in self.store.expired_active(now, 100).await? {
            self.expire(broadcast.id).await?;
        }
        Ok(())
    }
}

/// Dedup keeping first occurrence order.
pub fn dedup_preserving_order(ids: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.iter()
        .filter(|id| !id.trim().is_empty())
        .filter(|id| seen.insert((*id).clone()))
        .cloned()
        .collect()
}
