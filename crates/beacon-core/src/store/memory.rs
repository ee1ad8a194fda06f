//! In-memory `BroadcastStore`.
//!
//! One mutex around the whole state gives every trait operation the same
//! atomicity the Postgres backend gets from transactions.  Used by the test
//! suites and by single-node deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use beacon_protocol::{Broadcast, BroadcastStatus, DeliveryEventType, DeliveryStatus, ReadStatus};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    lifecycle_outbox_insert, BroadcastFilter, BroadcastStats, BroadcastStore, DeliveryRow,
    DltRecord, NewBroadcast, OutboxDrain, OutboxEvent, OutboxInsert, OutboxSink, UserMessage,
};
use crate::error::{CoreError, CoreResult};
use crate::lifecycle;

#[derive(Default)]
struct Inner {
    broadcasts: HashMap<Uuid, Broadcast>,
    /// Insertion order; list endpoints walk it backwards.
    order: Vec<Uuid>,
    deliveries: BTreeMap<(Uuid, String), DeliveryRow>,
    stats: HashMap<Uuid, BroadcastStats>,
    outbox: Vec<OutboxEvent>,
    quarantined: Vec<(OutboxEvent, String)>,
    dlt: Vec<DltRecord>,
    leases: HashMap<String, (String, DateTime<Utc>)>,
}

#[derive(Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Quarantined outbox rows with their reasons (test inspection).
    pub async fn quarantined_outbox(&self) -> Vec<(OutboxEvent, String)> {
        self.inner.lock().await.quarantined.clone()
    }

    /// Unpublished outbox rows in insertion order (test inspection).
    pub async fn outbox_snapshot(&self) -> Vec<OutboxEvent> {
        self.inner.lock().await.outbox.clone()
    }

    /// Delivery row lookup (test inspection).
    pub async fn delivery(&self, broadcast_id: Uuid, user_id: &str) -> Option<DeliveryRow> {
        self.inner
            .lock()
            .await
            .deliveries
            .get(&(broadcast_id, user_id.to_owned()))
            .cloned()
    }
}

fn push_events(inner: &mut Inner, events: &[OutboxInsert], now: DateTime<Utc>) {
    for event in events {
        inner.outbox.push(OutboxEvent {
            id: Uuid::new_v4(),
            aggregate_id: event.aggregate_id.clone(),
            event_type: event.event_type.clone(),
            topic: event.topic.clone(),
            payload: event.payload.clone(),
            created_at: now,
        });
    }
}


#[async_trait::async_trait]
impl BroadcastStore for MemoryStore {
    async fn insert_broadcast(
        &self,
        new: NewBroadcast,
        status: BroadcastStatus,
        events: &[OutboxInsert],
    ) -> CoreResult<Broadcast> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let broadcast = Broadcast {
            id: new.id,
            sender: new.sender,
            content: new.content,
            priority: new.priority,
            category: new.category,
            target: new.target,
            scheduled_at: new.scheduled_at,
            expires_at: new.expires_at,
            fire_and_forget: new.fire_and_forget,
            status,
            created_at: now,
            updated_at: now,
        };
        inner.order.push(broadcast.id);
        inner.broadcasts.insert(broadcast.id, broadcast.clone());
        inner.stats.insert(broadcast.id, BroadcastStats::default());
        push_events(&mut inner, events, now);
        Ok(broadcast)
    }

    async fn broadcast(&self, id: Uuid) -> CoreResult<Option<Broadcast>> {
        Ok(self.inner.lock().await.broadcasts.get(&id).cloned())
    }

    async fn list_broadcasts(
        &self,
        filter: BroadcastFilter,
        limit: i64,
    ) -> CoreResult<Vec<Broadcast>> {
        let inner = self.inner.lock().await;
        let matches = |b: &Broadcast| match filter {
            BroadcastFilter::All => true,
            BroadcastFilter::Active => b.status == BroadcastStatus::Active,
            BroadcastFilter::Scheduled => b.status == BroadcastStatus::Scheduled,
        };
        Ok(inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.broadcasts.get(id))
            .filter(|b| matches(b))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[BroadcastStatus],
        to: BroadcastStatus,
        events: &[OutboxInsert],
    ) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let Some(broadcast) = inner.broadcasts.get_mut(&id) else {
            return Err(CoreError::NotFound(format!("broadcast {id}")));
        };
        if !from.contains(&broadcast.status) {
            return Ok(false);
        }
        broadcast.status = to;
        broadcast.updated_at = now;
        push_events(&mut inner, events, now);
        Ok(true)
    }

    async fn activate_precomputed(&self, id: Uuid, topic: &str) -> CoreResult<Option<u64>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let Some(broadcast) = inner.broadcasts.get(&id).cloned() else {
            return Err(CoreError::NotFound(format!("broadcast {id}")));
        };
        if broadcast.status != BroadcastStatus::Ready {
            return Ok(None);
        }
        let users: Vec<String> = inner
            .deliveries
            .range((id, String::new())..)
            .take_while(|((b, _), _)| *b == id)
            .filter(|(_, row)| row.delivery_status == DeliveryStatus::Pending)
            .map(|((_, user), _)| user.clone())
            .collect();
        let events: Vec<OutboxInsert> = users
            .iter()
            .map(|user| {
                lifecycle_outbox_insert(&broadcast, user, DeliveryEventType::Created, topic, now)
            })
            .collect();
        {
            let b = inner.broadcasts.get_mut(&id).expect("checked above");
            b.status = BroadcastStatus::Active;
            b.updated_at = now;
        }
        push_events(&mut inner, &events, now);
        Ok(Some(users.len() as u64))
    }

    async fn supersede(
        &self,
        id: Uuid,
        to: BroadcastStatus,
        event_type: DeliveryEventType,
        topic: &str,
    ) -> CoreResult<Option<u64>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let Some(broadcast) = inner.broadcasts.get(&id).cloned() else {
            return Err(CoreError::NotFound(format!("broadcast {id}")));
        };
        if !lifecycle::can_transition(broadcast.status, to) {
            return Ok(None);
        }

        let mut superseded = 0u64;
        let mut events = Vec::new();
        let keys: Vec<(Uuid, String)> = inner
            .deliveries
            .range((id, String::new())..)
            .take_while(|((b, _), _)| *b == id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            let row = inner.deliveries.get_mut(&key).expect("key just listed");
            if row.delivery_status == DeliveryStatus::Pending {
                row.delivery_status = DeliveryStatus::Superseded;
                row.updated_at = now;
                superseded += 1;
            }
            events.push(lifecycle_outbox_insert(
                &broadcast, &key.1, event_type, topic, now,
            ));
        }

        {
            let b = inner.broadcasts.get_mut(&id).expect("checked above");
            b.status = to;
            b.updated_at = now;
        }
        push_events(&mut inner, &events, now);
        Ok(Some(superseded))
    }

    async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        fan_out_on_write: bool,
        limit: i64,
    ) -> CoreResult<Vec<Broadcast>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.broadcasts.get(id))
            .filter(|b| {
                b.status == BroadcastStatus::Scheduled
                    && b.target.fan_out_on_write() == fan_out_on_write
                    && b.scheduled_at.is_some_and(|at| at <= now)
            })
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn ready_broadcasts(&self, limit: i64) -> CoreResult<Vec<Broadcast>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.broadcasts.get(id))
            .filter(|b| b.status == BroadcastStatus::Ready)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn expired_active(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> CoreResult<Vec<Broadcast>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.broadcasts.get(id))
            .filter(|b| {
                b.status == BroadcastStatus::Active && b.expires_at.is_some_and(|at| at <= now)
            })
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn insert_delivery_batch(
        &self,
        broadcast_id: Uuid,
        user_ids: &[String],
    ) -> CoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut inserted = 0u64;
        for user in user_ids {
            let key = (broadcast_id, user.clone());
            if inner.deliveries.contains_key(&key) {
                continue;
            }
            inner.deliveries.insert(
                key,
                DeliveryRow {
                    broadcast_id,
                    user_id: user.clone(),
                    delivery_status: DeliveryStatus::Pending,
                    read_status: ReadStatus::Unread,
                    delivered_at: None,
                    read_at: None,
                    created_at: now,
                    updated_at: now,
                },
            );
            inserted += 1;
        }
        if inserted > 0 {
            inner
                .stats
                .entry(broadcast_id)
                .or_default()
                .total_targeted += inserted as i64;
        }
        Ok(inserted)
    }

    async fn mark_delivered(&self, broadcast_id: Uuid, user_id: &str) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let key = (broadcast_id, user_id.to_owned());
        let Some(row) = inner.deliveries.get_mut(&key) else {
            return Ok(false);
        };
        if row.delivery_status != DeliveryStatus::Pending {
            return Ok(false);
        }
        row.delivery_status = DeliveryStatus::Delivered;
        row.delivered_at = Some(now);
        row.updated_at = now;
        inner.stats.entry(broadcast_id).or_default().total_delivered += 1;
        Ok(true)
    }

    async fn mark_delivery_failed(&self, broadcast_id: Uuid, user_id: &str) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let key = (broadcast_id, user_id.to_owned());
        let Some(row) = inner.deliveries.get_mut(&key) else {
            return Ok(false);
        };
        if row.delivery_status != DeliveryStatus::Pending {
            return Ok(false);
        }
        row.delivery_status = DeliveryStatus::Failed;
        row.updated_at = now;
        inner.stats.entry(broadcast_id).or_default().total_failed += 1;
        Ok(true)
    }

    async fn mark_read(
        &self,
        broadcast_id: Uuid,
        user_id: &str,
        events: &[OutboxInsert],
    ) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let key = (broadcast_id, user_id.to_owned());
        let Some(row) = inner.deliveries.get_mut(&key) else {
            return Err(CoreError::NotFound(format!(
                "delivery {broadcast_id}/{user_id}"
            )));
        };
        if row.read_status == ReadStatus::Read {
            return Ok(false);
        }
        row.read_status = ReadStatus::Read;
        row.read_at = Some(now);
        row.updated_at = now;
        inner.stats.entry(broadcast_id).or_default().total_read += 1;
        push_events(&mut inner, events, now);
        Ok(true)
    }

    async fn mark_all_read(&self, user_id: &str, topic: &str) -> CoreResult<Vec<Uuid>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut changed = Vec::new();
        let mut events = Vec::new();
        let keys: Vec<(Uuid, String)> = inner
            .deliveries
            .iter()
            .filter(|((_, user), row)| user == user_id && row.read_status == ReadStatus::Unread)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            let row = inner.deliveries.get_mut(&key).expect("key just listed");
            row.read_status = ReadStatus::Read;
            row.read_at = Some(now);
            row.updated_at = now;
            inner.stats.entry(key.0).or_default().total_read += 1;
            if let Some(broadcast) = inner.broadcasts.get(&key.0) {
                events.push(lifecycle_outbox_insert(
                    broadcast,
                    user_id,
                    DeliveryEventType::Read,
                    topic,
                    now,
                ));
            }
            changed.push(key.0);
        }
        push_events(&mut inner, &events, now);
        Ok(changed)
    }

    async fn reset_delivery(&self, broadcast_id: Uuid, user_id: &str) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let key = (broadcast_id, user_id.to_owned());
        let Some(status) = inner.deliveries.get(&key).map(|row| row.delivery_status) else {
            return Ok(false);
        };
        if status == DeliveryStatus::Pending {
            return Ok(true);
        }
        if status == DeliveryStatus::Delivered {
            inner.stats.entry(broadcast_id).or_default().total_delivered -= 1;
        }
        let row = inner.deliveries.get_mut(&key).expect("checked above");
        row.delivery_status = DeliveryStatus::Pending;
        row.delivered_at = None;
        row.updated_at = now;
        Ok(true)
    }

    async fn deliveries(
        &self,
        broadcast_id: Uuid,
        status: Option<DeliveryStatus>,
        limit: i64,
        offset: i64,
    ) -> CoreResult<Vec<DeliveryRow>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .deliveries
            .range((broadcast_id, String::new())..)
            .take_while(|((b, _), _)| *b == broadcast_id)
            .map(|(_, row)| row)
            .filter(|row| status.map_or(true, |s| row.delivery_status == s))
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn user_messages(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: i64,
    ) -> CoreResult<Vec<UserMessage>> {
        let inner = self.inner.lock().await;
        let mut messages: Vec<UserMessage> = inner
            .deliveries
            .iter()
            .filter(|((_, user), _)| user == user_id)
            .filter(|(_, row)| row.delivery_status != DeliveryStatus::Superseded)
            .filter(|(_, row)| !unread_only || row.read_status == ReadStatus::Unread)
            .filter_map(|((broadcast_id, _), row)| {
                inner.broadcasts.get(broadcast_id).map(|b| UserMessage {
                    broadcast: b.clone(),
                    delivery_status: row.delivery_status,
                    read_status: row.read_status,
                    created_at: row.created_at,
                })
            })
            .collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        messages.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(messages)
    }

    async fn undelivered_for_user(&self, user_id: &str) -> CoreResult<Vec<Broadcast>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .deliveries
            .iter()
            .filter(|((_, user), row)| {
                user == user_id && row.delivery_status == DeliveryStatus::Pending
            })
            .filter_map(|((broadcast_id, _), _)| inner.broadcasts.get(broadcast_id))
            .filter(|b| b.status == BroadcastStatus::Active)
            .cloned()
            .collect())
    }

    async fn stats(&self, broadcast_id: Uuid) -> CoreResult<BroadcastStats> {
        Ok(self
            .inner
            .lock()
            .await
            .stats
            .get(&broadcast_id)
            .copied()
            .unwrap_or_default())
    }

    async fn drain_outbox(&self, limit: i64, sink: &dyn OutboxSink) -> CoreResult<OutboxDrain> {
        // The mutex is held across the publishes: the memory analog of the
        // poller's transaction.
        let mut inner = self.inner.lock().await;
        let batch: Vec<OutboxEvent> = inner
            .outbox
            .iter()
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect();

        let mut drain = OutboxDrain::default();
        let mut published_ids = Vec::new();
        for event in &batch {
            if serde_json::from_str::<serde_json::Value>(&event.payload).is_err() {
                let pos = inner
                    .outbox
                    .iter()
                    .position(|e| e.id == event.id)
                    .expect("batch row present");
                let poison = inner.outbox.remove(pos);
                inner
                    .quarantined
                    .push((poison, "payload failed to deserialize".to_owned()));
                drain.quarantined += 1;
                continue;
            }
            sink.publish(event).await?;
            published_ids.push(event.id);
            drain.published += 1;
        }
        inner.outbox.retain(|event| !published_ids.contains(&event.id));
        Ok(drain)
    }

    async fn outbox_depth(&self) -> CoreResult<i64> {
        Ok(self.inner.lock().await.outbox.len() as i64)
    }

    async fn insert_dlt(&self, record: DltRecord) -> CoreResult<()> {
        self.inner.lock().await.dlt.push(record);
        Ok(())
    }

    async fn list_dlt(&self, limit: i64) -> CoreResult<Vec<DltRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .dlt
            .iter()
            .rev()
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn dlt_record(&self, id: Uuid) -> CoreResult<Option<DltRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .dlt
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn delete_dlt(&self, id: Uuid) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.dlt.len();
        inner.dlt.retain(|r| r.id != id);
        Ok(inner.dlt.len() < before)
    }

    async fn purge_dlt(&self) -> CoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let purged = inner.dlt.len() as u64;
        inner.dlt.clear();
        Ok(purged)
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.leases.get(name) {
            Some((current, locked_until)) if current != holder && *locked_until > now => Ok(false),
            _ => {
                inner
                    .leases
                    .insert(name.to_owned(), (holder.to_owned(), until));
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, name: &str, holder: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner
            .leases
            .get(name)
            .is_some_and(|(current, _)| current == holder)
        {
            inner.leases.remove(name);
        }
        Ok(())
    }
}
