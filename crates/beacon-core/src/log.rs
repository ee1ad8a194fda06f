//! Message-log interface.
//!
//! One orchestration topic partitioned by routing key, plus a `-dlt` sibling
//! per topic.  Publishes are synchronous: the call returns only once the
//! broker acknowledged the record, which is what lets the outbox poller
//! delete rows safely.  Consumers in a group share offsets and observe each
//! partition in order — that, together with outbox insertion order, carries
//! the per-user ordering guarantee.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoreResult;

pub mod memory;

/// Dead-letter sibling of a topic.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}-dlt")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    pub partition: u32,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Publish and wait for the broker acknowledgment.
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> CoreResult<RecordMeta>;

    /// Compaction tombstone: an empty-payload record under the same key.
    async fn publish_tombstone(&self, topic: &str, key: &str) -> CoreResult<RecordMeta> {
        self.publish(topic, key, &[]).await
    }

    /// Join `group` on `topic`.  Consumers in one group share offsets.
    async fn subscribe(&self, topic: &str, group: &str) -> CoreResult<Box<dyn LogConsumer>>;
}

#[async_trait]
pub trait LogConsumer: Send {
    /// Next record in per-partition order, or `None` after `max_wait` with
    /// nothing to consume.
    async fn poll(&mut self, max_wait: Duration) -> CoreResult<Option<LogRecord>>;
}
