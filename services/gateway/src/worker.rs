//! Delivery worker: the grid's continuous-query observer.
//!
//! Watches inbox mutations, filters to users with streams on this pod, and
//! owns the delivery semantics: a successful stream push transitions the
//! delivery row `PENDING -> DELIVERED` and bumps the counters.  The worker
//! receives the stream registry as a plain sink capability — it never owns
//! streams.

use std::sync::Arc;

use beacon_core::config::Settings;
use beacon_core::error::{CoreError, CoreResult};
use beacon_core::grid::{GridCache, GridEvent, GridEventKind};
use beacon_core::store::BroadcastStore;
use beacon_protocol::{Broadcast, RemovalReason, StreamFrame};
use chrono::Utc;
use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::streams::StreamRegistry;

pub struct DeliveryWorker {
    store: Arc<dyn BroadcastStore>,
    grid: Arc<dyn GridCache>,
    streams: Arc<StreamRegistry>,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn BroadcastStore>,
        grid: Arc<dyn GridCache>,
        streams: Arc<StreamRegistry>,
    ) -> Self {
        DeliveryWorker {
            store,
            grid,
            streams,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.grid.watch_events();
        info!("delivery worker observing grid");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("delivery worker stopping");
                        return;
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Err(e) = self.handle(event).await {
                                // Stream-side trouble never propagates into
                                // the durable pipeline.
                                warn!(error = %e, "grid event handling failed");
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "grid event stream lagged");
                        }
                        Err(RecvError::Closed) => {
                            error!("grid event stream closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    pub async fn handle(&self, event: GridEvent) -> CoreResult<()> {
        // Continuous-query scope: only users attached to this pod.
        if !self.streams.has_stream(&event.user_id).await {
            return Ok(());
        }
        match event.kind {
            GridEventKind::Message => self.deliver_message(&event).await,
            GridEventKind::ReadReceipt => {
                self.streams
                    .send_to_user(
                        &event.user_id,
                        &StreamFrame::ReadReceipt {
                            broadcast_id: event.broadcast_id,
                            user_id: event.user_id.clone(),
                            read_at: Utc::now(),
                        },
                    )
                    .await;
                Ok(())
            }
            GridEventKind::MessageRemoved => {
                self.streams
                    .send_to_user(
                        &event.user_id,
                        &StreamFrame::MessageRemoved {
                            broadcast_id: event.broadcast_id,
                            reason: event.removal_reason.unwrap_or(RemovalReason::Cancelled),
                        },
                    )
                    .await;
                Ok(())
            }
        }
    }

    async fn deliver_message(&self, event: &GridEvent) -> CoreResult<()> {
        let broadcast = self.broadcast_content(event.broadcast_id).await?;
        let sent = self
            .streams
            .send_to_user(&event.user_id, &StreamFrame::Message { broadcast: broadcast.clone() })
            .await;

        if sent == 0 {
            // No open stream after all: the row stays PENDING and pending
            // events redeliver on reconnect.
            debug!(
                user_id = %event.user_id,
                broadcast_id = %event.broadcast_id,
                "no open stream, leaving delivery pending"
            );
            return Ok(());
        }

        if !broadcast.fire_and_forget {
            let transitioned = self
                .store
                .mark_delivered(event.broadcast_id, &event.user_id)
                .await?;
            debug!(
                user_id = %event.user_id,
                broadcast_id = %event.broadcast_id,
                streams = sent,
                transitioned,
                "message delivered"
            );
        }
        Ok(())
    }

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
}

/// Heartbeat ticker: keepalive frames on every open stream plus heartbeat
/// epoch bumps in the grid, every `sse_heartbeat_interval`.
pub async fn run_heartbeat_loop(
    streams: Arc<StreamRegistry>,
    grid: Arc<dyn GridCache>,
    settings: Arc<Settings>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(settings.sse_heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                let sent = streams
                    .broadcast_frame(&StreamFrame::Heartbeat { epoch: now.timestamp() })
                    .await;
                streams.note_heartbeats(sent as u64);
                let connection_ids = streams.connection_ids().await;
                if !connection_ids.is_empty() {
                    if let Err(e) = grid.bump_heartbeats(&connection_ids, now.timestamp()).await {
                        warn!(error = %e, "heartbeat bump failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
