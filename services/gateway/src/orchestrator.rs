//! Orchestrator consumer: turns orchestration-topic records into grid state.
//!
//! For group events the audience is resolved at consume time (fan-out on
//! read): delivery rows are written for the whole audience, online users get
//! inbox entries, offline users get TTL-bounded pending events.  Per-user
//! events already name their user.  A record that exhausts the retry budget
//! is dead-lettered with full context and consumption moves on.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use beacon_core::config::Settings;
use beacon_core::directory::UserDirectory;
use beacon_core::error::{CoreError, CoreResult};
use beacon_core::grid::{GridCache, InboxEntry};
use beacon_core::log::{dead_letter_topic, EventLog, LogConsumer, LogRecord};
use beacon_core::store::{BroadcastStore, DltRecord};
use beacon_protocol::{
    Broadcast, DeliveryEventType, DeliveryStatus, MessageDeliveryEvent, ReadStatus, RemovalReason,
    TargetSpec,
};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const POLL_WAIT: Duration = Duration::from_millis(500);

pub struct Orchestrator {
    store: Arc<dyn BroadcastStore>,
    grid: Arc<dyn GridCache>,
    log: Arc<dyn EventLog>,
    directory: Arc<dyn UserDirectory>,
    settings: Arc<Settings>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn BroadcastStore>,
        grid: Arc<dyn GridCache>,
        log: Arc<dyn EventLog>,
        directory: Arc<dyn UserDirectory>,
        settings: Arc<Settings>,
    ) -> Self {
        Orchestrator {
            store,
            grid,
            log,
            directory,
            settings,
        }
    }

    /// Consume until shutdown.  Partition order is preserved because one
    /// consumer in the group observes each partition serially.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut consumer = loop {
            match self
                .log
                .subscribe(
                    &self.settings.orchestration_topic,
                    &self.settings.orchestration_group,
                )
                .await
            {
                Ok(consumer) => break consumer,
                Err(e) => {
                    error!(error = %e, "orchestration subscribe failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };
        info!(
            topic = %self.settings.orchestration_topic,
            group = %self.settings.orchestration_group,
            "orchestrator consuming"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("orchestrator stopping");
                        return;
                    }
                }
                polled = consumer.poll(POLL_WAIT) => {
                    match polled {
                        Ok(Some(record)) => self.handle_with_retry(record).await,
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "orchestration poll failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }

    /// Fixed-backoff retry budget, then the dead-letter sibling topic.
    /// Poison payloads skip the budget: retrying a parse never helps.
    pub async fn handle_with_retry(&self, record: LogRecord) {
        let budget = self.settings.log_retry_max_attempts.max(1);
        for attempt in 1..=budget {
            match self.process(&record).await {
                Ok(()) => return,
                Err(e @ CoreError::SerializationPoison(_)) => {
                    self.dead_letter(&record, "SerializationPoison", &e.to_string())
                        .await;
                    return;
                }
                Err(e) if attempt < budget => {
                    warn!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        attempt,
                        error = %e,
                        "event processing failed, retrying"
                    );
                    tokio::time::sleep(self.settings.log_retry_backoff).await;
                }
                Err(e) => {
                    self.dead_letter(&record, "ProcessingFailure", &e.to_string())
                        .await;
                    return;
                }
            }
        }
    }

    async fn process(&self, record: &LogRecord) -> CoreResult<()> {
        let event: MessageDeliveryEvent = serde_json::from_slice(&record.payload)?;
        let broadcast = self.broadcast_content(event.broadcast_id).await?;

        match event.event_type {
            DeliveryEventType::Created => match event.user_id.as_deref() {
                Some(user_id) => self.deliver(user_id, &broadcast, &event).await,
                None => self.fan_out(&broadcast, &event).await,
            },
            DeliveryEventType::Read => {
                if let Some(user_id) = event.user_id.as_deref() {
                    self.grid
                        .mark_inbox_read(user_id, event.broadcast_id)
                        .await?;
                    // The inbox is a read cache over the durable rows; the
                    // next read rebuilds it with the new read state.
                    self.grid.evict_inbox(user_id).await?;
                }
                Ok(())
            }
            DeliveryEventType::Cancelled | DeliveryEventType::Expired => {
                let reason = if event.event_type == DeliveryEventType::Cancelled {
                    RemovalReason::Cancelled
                } else {
                    RemovalReason::Expired
                };
                if let Some(user_id) = event.user_id.as_deref() {
                    self.grid
                        .remove_inbox(user_id, event.broadcast_id, reason)
                        .await?;
                    self.grid.evict_inbox(user_id).await?;
                }
                // The content cache must not serve a dead broadcast.
                self.grid.evict_broadcast(event.broadcast_id).await?;
                Ok(())
            }
            DeliveryEventType::Failed => {
                if let Some(user_id) = event.user_id.as_deref() {
                    self.store
                        .mark_delivery_failed(event.broadcast_id, user_id)
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// Hot cache first, durable store second, repopulate on miss.
    async fn broadcast_content(&self, id: Uuid) -> CoreResult<Broadcast> {
        if let Some(broadcast) = self.grid.cached_broadcast(id).await? {
            return Ok(broadcast);
        }
        let Some(broadcast) = self.store.broadcast(id).await? else {
            return Err(CoreError::NotFound(format!("broadcast {id}")));
        };
        self.grid.cache_broadcast(broadcast.clone()).await?;
        Ok(broadcast)
    }

    /// Group event: resolve the audience against the directory, intersect
    /// with the online index for inbox pushes, queue the rest.
    async fn fan_out(
        &self,
        broadcast: &Broadcast,
        event: &MessageDeliveryEvent,
    ) -> CoreResult<()> {
        let audience = self.resolve(&broadcast.target).await?;
        let online: HashSet<String> = self.grid.online_users().await?.into_iter().collect();

        if !broadcast.fire_and_forget {
            for chunk in audience.chunks(self.settings.db_batch_size) {
                self.store
                    .insert_delivery_batch(broadcast.id, chunk)
                    .await?;
            }
        }

        let mut pushed = 0usize;
        let mut queued = 0usize;
        for user_id in &audience {
            if online.contains(user_id) {
                self.push_entry(user_id, broadcast).await?;
                pushed += 1;
            } else if !broadcast.fire_and_forget {
                let mut per_user = event.clone();
                per_user.user_id = Some(user_id.clone());
                self.enqueue_pending(user_id, per_user).await?;
                queued += 1;
            }
        }
        debug!(
            broadcast_id = %broadcast.id,
            audience = audience.len(),
            pushed,
            queued,
            "group event fanned out"
        );
        Ok(())
    }

    async fn deliver(
        &self,
        user_id: &str,
        broadcast: &Broadcast,
        event: &MessageDeliveryEvent,
    ) -> CoreResult<()> {
        if self.grid.user_connections(user_id).await?.is_some() {
            self.push_entry(user_id, broadcast).await?;
        } else if !broadcast.fire_and_forget {
            self.enqueue_pending(user_id, event.clone()).await?;
        }
        Ok(())
    }

    async fn push_entry(&self, user_id: &str, broadcast: &Broadcast) -> CoreResult<()> {
        self.grid
            .push_inbox(
                user_id,
                InboxEntry {
                    entry_id: Uuid::new_v4(),
                    broadcast_id: broadcast.id,
                    delivery_status: DeliveryStatus::Pending,
                    read_status: ReadStatus::Unread,
                    created_at: Utc::now(),
                },
            )
            .await
    }

    async fn enqueue_pending(
        &self,
        user_id: &str,
        event: MessageDeliveryEvent,
    ) -> CoreResult<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.settings.pending_event_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        self.grid.enqueue_pending(user_id, event, expires_at).await
    }

    async fn resolve(&self, target: &TargetSpec) -> CoreResult<Vec<String>> {
        match target {
            TargetSpec::All => self.directory.all_user_ids().await,
            TargetSpec::Role { role } => self.directory.users_with_role(role).await,
            TargetSpec::Product { product } => self.directory.product_subscribers(product).await,
            TargetSpec::Selected { user_ids } => {
                let mut seen = HashSet::new();
                Ok(user_ids
                    .iter()
                    .filter(|id| seen.insert((*id).clone()))
                    .cloned()
                    .collect())
            }
        }
    }

    /// Quarantine with full context: record + publish to the `-dlt` sibling.
    async fn dead_letter(&self, record: &LogRecord, title: &str, detail: &str) {
        error!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            key = %record.key,
            title,
            detail,
            "dead-lettering event"
        );
        let dlt_record = DltRecord {
            id: Uuid::new_v4(),
            original_topic: record.topic.clone(),
            partition: record.partition as i32,
            offset: record.offset as i64,
            key: record.key.clone(),
            fail_title: title.to_owned(),
            fail_detail: detail.to_owned(),
            payload: record.payload.clone(),
            failed_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_dlt(dlt_record).await {
            error!(error = %e, "failed to persist dead letter");
        }
        if let Err(e) = self
            .log
            .publish(&dead_letter_topic(&record.topic), &record.key, &record.payload)
            .await
        {
            error!(error = %e, "failed to publish to dead-letter topic");
        }
    }
}
