//! Outbox poller: drains unpublished rows to the log.
//!
//! One leader runs this per cluster (lease-gated in the scheduler); each
//! tick drains a batch through [`LogSink`], which publishes synchronously
//! with a per-call timeout.  Rows are deleted only after the whole batch
//! acked; a failure leaves them in place and the next tick retries.

use std::sync::Arc;
use std::time::Duration;

use beacon_core::error::{CoreError, CoreResult};
use beacon_core::log::EventLog;
use beacon_core::store::{BroadcastStore, OutboxDrain, OutboxEvent, OutboxSink};
use tracing::{debug, info};

/// Outbox sink over the event log, bounding every publish.
pub struct LogSink {
    log: Arc<dyn EventLog>,
    publish_timeout: Duration,
}

impl LogSink {
    pub fn new(log: Arc<dyn EventLog>, publish_timeout: Duration) -> Self {
        LogSink {
            log,
            publish_timeout,
        }
    }
}

#[async_trait::async_trait]
impl OutboxSink for LogSink {
    async fn publish(&self, event: &OutboxEvent) -> CoreResult<()> {
        let publish = self
            .log
            .publish(&event.topic, &event.aggregate_id, event.payload.as_bytes());
        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(CoreError::LogUnavailable(format!(
                "publish of outbox event {} timed out",
                event.id
            ))),
        }
    }
}

pub struct OutboxPoller {
    store: Arc<dyn BroadcastStore>,
    sink: LogSink,
    batch_size: i64,
}

impl OutboxPoller {
    pub fn new(
        store: Arc<dyn BroadcastStore>,
        log: Arc<dyn EventLog>,
        batch_size: usize,
        publish_timeout: Duration,
    ) -> Self {
        OutboxPoller {
            store,
            sink: LogSink::new(log, publish_timeout),
            batch_size: batch_size as i64,
        }
    }

    /// One poll pass; the caller holds the leader lease.
    pub async fn tick(&self) -> CoreResult<OutboxDrain> {
        let drain = self.store.drain_outbox(self.batch_size, &self.sink).await?;
        if drain.published > 0 || drain.quarantined > 0 {
            info!(
                published = drain.published,
                quarantined = drain.quarantined,
                "outbox drained"
            );
        } else {
            debug!("outbox empty");
        }
        Ok(drain)
    }
}
