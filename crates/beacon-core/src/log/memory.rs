//! In-memory partitioned log.
//!
//! Records are appended to `hash(key) % partitions`; consumer groups keep a
//! shared offset vector per topic and are woken through a `Notify` when new
//! records land.  Good enough to carry the ordering and at-least-once
//! semantics the pipeline needs in tests and single-node deployments.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock};

use super::{EventLog, LogConsumer, LogRecord, RecordMeta};
use crate::error::CoreResult;

const DEFAULT_PARTITIONS: u32 = 8;

struct StoredRecord {
    key: String,
    payload: Vec<u8>,
}

struct TopicState {
    partitions: Vec<RwLock<Vec<StoredRecord>>>,
    notify: Notify,
}

impl TopicState {
    fn new(partition_count: u32) -> Self {
        TopicState {
            partitions: (0..partition_count).map(|_| RwLock::new(Vec::new())).collect(),
            notify: Notify::new(),
        }
    }
}

#[derive(Clone)]
pub struct MemoryLog {
    topics: Arc<RwLock<HashMap<String, Arc<TopicState>>>>,
    groups: Arc<Mutex<HashMap<(String, String), Arc<Mutex<Vec<u64>>>>>>,
    partition_count: u32,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partitions(partition_count: u32) -> Self {
        MemoryLog {
            topics: Arc::new(RwLock::new(HashMap::new())),
            groups: Arc::new(Mutex::new(HashMap::new())),
            partition_count: partition_count.max(1),
        }
    }

    fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.partition_count)) as u32
    }

    async fn topic(&self, name: &str) -> Arc<TopicState> {
        {
            let topics = self.topics.read().await;
            if let Some(state) = topics.get(name) {
                return state.clone();
            }
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(TopicState::new(self.partition_count)))
            .clone()
    }

    /// Total records on a topic (test inspection).
    pub async fn topic_len(&self, name: &str) -> usize {
        let state = self.topic(name).await;
        let mut total = 0;
        for partition in &state.partitions {
            total += partition.read().await.len();
        }
        total
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryLog {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> CoreResult<RecordMeta> {
        let state = self.topic(topic).await;
        let partition = self.partition_for(key);
        let offset = {
            let mut records = state.partitions[partition as usize].write().await;
            records.push(StoredRecord {
                key: key.to_owned(),
                payload: payload.to_vec(),
            });
            (records.len() - 1) as u64
        };
        state.notify.notify_waiters();
        Ok(RecordMeta { partition, offset })
    }

    async fn subscribe(&self, topic: &str, group: &str) -> CoreResult<Box<dyn LogConsumer>> {
        let state = self.topic(topic).await;
        let offsets = {
            let mut groups = self.groups.lock().await;
            groups
                .entry((topic.to_owned(), group.to_owned()))
                .or_insert_with(|| {
                    Arc::new(Mutex::new(vec![0; self.partition_count as usize]))
                })
                .clone()
        };
        Ok(Box::new(MemoryConsumer {
            topic: topic.to_owned(),
            state,
            offsets,
        }))
    }
}

struct MemoryConsumer {
    topic: String,
    state: Arc<TopicState>,
    offsets: Arc<Mutex<Vec<u64>>>,
}

impl MemoryConsumer {
    async fn try_next(&mut self) -> Option<LogRecord> {
        let mut offsets = self.offsets.lock().await;
        for (partition, offset) in offsets.iter_mut().enumerate() {
            let records = self.state.partitions[partition].read().await;
            if let Some(record) = records.get(usize::try_from(*offset).ok()?) {
                let result = LogRecord {
                    topic: self.topic.clone(),
                    partition: partition as u32,
                    offset: *offset,
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                };
                *offset += 1;
                return Some(result);
            }
        }
        None
    }
}

#[async_trait::async_trait]
impl LogConsumer for MemoryConsumer {
    async fn poll(&mut self, max_wait: Duration) -> CoreResult<Option<LogRecord>> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(record) = self.try_next().await {
                return Ok(Some(record));
            }
            let state = self.state.clone();
            let notified = state.notify.notified();
            // Re-check after arming the waiter: a publish may have landed
            // between try_next and notified().
            if let Some(record) = self.try_next().await {
                return Ok(Some(record));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_with_one_key_are_consumed_in_publish_order() {
        let log = MemoryLog::with_partitions(4);
        for i in 0..10u8 {
            log.publish("topic", "user-1", &[i]).await.unwrap();
        }

        let mut consumer = log.subscribe("topic", "g1").await.unwrap();
        for i in 0..10u8 {
            let record = consumer
                .poll(Duration::from_millis(100))
                .await
                .unwrap()
                .expect("record available");
            assert_eq!(record.payload, vec![i]);
            assert_eq!(record.key, "user-1");
        }
        assert!(consumer
            .poll(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn one_key_always_maps_to_one_partition() {
        let log = MemoryLog::with_partitions(8);
        let first = log.publish("topic", "user-9", b"a").await.unwrap();
        let second = log.publish("topic", "user-9", b"b").await.unwrap();
        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
    }

    #[tokio::test]
    async fn group_offsets_are_shared_and_survive_resubscribe() {
        let log = MemoryLog::new();
        log.publish("topic", "k", b"1").await.unwrap();
        log.publish("topic", "k", b"2").await.unwrap();

        let mut consumer = log.subscribe("topic", "g1").await.unwrap();
        let record = consumer.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(record.payload, b"1");
        drop(consumer);

        // A replacement consumer in the same group resumes, not restarts.
        let mut consumer = log.subscribe("topic", "g1").await.unwrap();
        let record = consumer.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(record.payload, b"2");

        // A different group starts from the beginning.
        let mut other = log.subscribe("topic", "g2").await.unwrap();
        let record = other.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(record.payload, b"1");
    }

    #[tokio::test]
    async fn poll_wakes_on_publish() {
        let log = MemoryLog::new();
        let mut consumer = log.subscribe("topic", "g1").await.unwrap();

        let publisher = log.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("topic", "k", b"x").await.unwrap();
        });

        let record = consumer
            .poll(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("published record must wake the poll");
        assert_eq!(record.payload, b"x");
        handle.await.unwrap();
    }
}
