//! Dead-letter manager: inspect, redrive and purge quarantined events.
//!
//! Redrive resets the originating delivery row to `PENDING` in its own
//! transaction before republishing: if the republish fails the record stays
//! redrivable, and redriving N times converges on the same durable state as
//! redriving once.

use std::sync::Arc;

use beacon_core::error::CoreResult;
use beacon_core::log::{dead_letter_topic, EventLog};
use beacon_core::store::{BroadcastStore, DltRecord};
use beacon_protocol::MessageDeliveryEvent;
use tracing::{info, warn};
use uuid::Uuid;

pub struct DltManager {
    store: Arc<dyn BroadcastStore>,
    log: Arc<dyn EventLog>,
}

impl DltManager {
    pub fn new(store: Arc<dyn BroadcastStore>, log: Arc<dyn EventLog>) -> Self {
        DltManager { store, log }
    }

    pub async fn list(&self, limit: i64) -> CoreResult<Vec<DltRecord>> {
        self.store.list_dlt(limit).await
    }

    /// Redrive one record: reset the row, republish to the original topic
    /// with the original key, then drop the record.  `Ok(false)` when the
    /// record does not exist.
    pub async fn redrive(&self, id: Uuid) -> CoreResult<bool> {
        let Some(record) = self.store.dlt_record(id).await? else {
            return Ok(false);
        };

        // Step 1, independent transaction: the row goes back to PENDING so
        // the redelivered event can take it to DELIVERED again.  If step 2
        // fails the record remains and a later redrive repeats both steps.
        if let Ok(event) = serde_json::from_slice::<MessageDeliveryEvent>(&record.payload) {
            if let Some(user_id) = event.user_id.as_deref() {
                self.store
                    .reset_delivery(event.broadcast_id, user_id)
                    .await?;
            }
        } else {
            warn!(dlt_id = %id, "redriving a payload that does not parse as a delivery event");
        }

        // Step 2: same key, original topic — partition placement and
        // per-user ordering are preserved.
        self.log
            .publish(&record.original_topic, &record.key, &record.payload)
            .await?;
        self.store.delete_dlt(id).await?;
        info!(dlt_id = %id, topic = %record.original_topic, "dead letter redriven");
        Ok(true)
    }

    /// Redrive everything; returns how many records were redriven.
    pub async fn redrive_all(&self) -> CoreResult<u64> {
        let mut redriven = 0u64;
        for record in self.store.list_dlt(i64::MAX).await? {
            if self.redrive(record.id).await? {
                redriven += 1;
            }
        }
        Ok(redriven)
    }

    /// Purge one record, tombstoning its dead-letter partition.
    pub async fn purge(&self, id: Uuid) -> CoreResult<bool> {
        let Some(record) = self.store.dlt_record(id).await? else {
            return Ok(false);
        };
        self.log
            .publish_tombstone(&dead_letter_topic(&record.original_topic), &record.key)
            .await?;
        let deleted = self.store.delete_dlt(id).await?;
        info!(dlt_id = %id, "dead letter purged");
        Ok(deleted)
    }

    pub async fn purge_all(&self) -> CoreResult<u64> {
        for record in self.store.list_dlt(i64::MAX).await? {
            self.log
                .publish_tombstone(&dead_letter_topic(&record.original_topic), &record.key)
                .await?;
        }
        self.store.purge_dlt().await
    }
}
