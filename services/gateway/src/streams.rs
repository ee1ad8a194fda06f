//! Per-process stream registry.
//!
//! Maps `user -> {connection -> bounded frame queue}`.  Each open client
//! stream has exactly one sender loop draining its queue into the SSE
//! response; dispatch never suspends on a slow consumer — a send that cannot
//! complete within the write budget tears the stream down instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beacon_protocol::StreamFrame;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

pub struct StreamRegistry {
    inner: RwLock<HashMap<String, HashMap<String, mpsc::Sender<StreamFrame>>>>,
    queue_capacity: usize,
    write_budget: Duration,
    frames_sent: AtomicU64,
    heartbeats_sent: AtomicU64,
}

impl StreamRegistry {
    pub fn new(queue_capacity: usize, write_budget: Duration) -> Self {
        StreamRegistry {
            inner: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            write_budget,
            frames_sent: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
        }
    }

    /// Open a stream; the returned receiver is the stream's frame source.
    pub async fn attach(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> mpsc::Receiver<StreamFrame> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mut inner = self.inner.write().await;
        inner
            .entry(user_id.to_owned())
            .or_default()
            .insert(connection_id.to_owned(), tx);
        debug!(user_id, connection_id, "stream attached");
        rx
    }

    /// Close a stream.  Idempotent; dropping the sender ends the SSE loop.
    pub async fn detach(&self, user_id: &str, connection_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(streams) = inner.get_mut(user_id) {
            streams.remove(connection_id);
            if streams.is_empty() {
                inner.remove(user_id);
            }
        }
        debug!(user_id, connection_id, "stream detached");
    }

    pub async fn has_stream(&self, user_id: &str) -> bool {
        self.inner.read().await.contains_key(user_id)
    }

    /// Push a frame to every open stream of one user; returns how many
    /// streams took it.  Streams that block past the write budget are dead
    /// and get detached.
    pub async fn send_to_user(&self, user_id: &str, frame: &StreamFrame) -> usize {
        let senders: Vec<(String, mpsc::Sender<StreamFrame>)> = {
            let inner = self.inner.read().await;
            match inner.get(user_id) {
                Some(streams) => streams
                    .iter()
                    .map(|(id, tx)| (id.clone(), tx.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (connection_id, tx) in senders {
            match tx.send_timeout(frame.clone(), self.write_budget).await {
                Ok(()) => delivered += 1,
                Err(_) => {
                    warn!(user_id, connection_id = %connection_id, "stream write exceeded budget, closing");
                    dead.push(connection_id);
                }
            }
        }
        for connection_id in dead {
            self.detach(user_id, &connection_id).await;
        }
        if delivered > 0 {
            self.frames_sent.fetch_add(delivered as u64, Ordering::Relaxed);
        }
        delivered
    }

    /// Push a frame to one specific stream.
    pub async fn send_to_connection(
        &self,
        user_id: &str,
        connection_id: &str,
        frame: StreamFrame,
    ) -> bool {
        let tx = {
            let inner = self.inner.read().await;
            inner
                .get(user_id)
                .and_then(|streams| streams.get(connection_id))
                .cloned()
        };
        let Some(tx) = tx else {
            return false;
        };
        if tx.send_timeout(frame, self.write_budget).await.is_err() {
            self.detach(user_id, connection_id).await;
            return false;
        }
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Send to every open stream (shutdown, global notices).
    pub async fn broadcast_frame(&self, frame: &StreamFrame) -> usize {
        let users: Vec<String> = self.inner.read().await.keys().cloned().collect();
        let mut delivered = 0;
        for user in users {
            delivered += self.send_to_user(&user, frame).await;
        }
        delivered
    }

    /// All open connection ids (heartbeat bumps).
    pub async fn connection_ids(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .values()
            .flat_map(|streams| streams.keys().cloned())
            .collect()
    }

    /// `(users with streams, open streams)`.
    pub async fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read().await;
        let streams = inner.values().map(HashMap::len).sum();
        (inner.len(), streams)
    }

    /// Drop every stream; queued frames still drain to clients.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        let (users, streams): (usize, usize) =
            (inner.len(), inner.values().map(HashMap::len).sum());
        inner.clear();
        info!(users, streams, "all streams closed");
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn note_heartbeats(&self, count: u64) {
        self.heartbeats_sent.fetch_add(count, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> StreamFrame {
        StreamFrame::Heartbeat { epoch: 1 }
    }

    #[tokio::test]
    async fn frames_reach_every_open_stream_of_a_user() {
        let registry = StreamRegistry::new(8, Duration::from_millis(100));
        let mut rx1 = registry.attach("u1", "c1").await;
        let mut rx2 = registry.attach("u1", "c2").await;
        registry.attach("u2", "c3").await;

        assert_eq!(registry.send_to_user("u1", &frame()).await, 2);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
        assert_eq!(registry.counts().await, (2, 3));
    }

    #[tokio::test]
    async fn detach_is_idempotent_and_prunes_empty_users() {
        let registry = StreamRegistry::new(8, Duration::from_millis(100));
        let _rx = registry.attach("u1", "c1").await;
        registry.detach("u1", "c1").await;
        registry.detach("u1", "c1").await;
        assert!(!registry.has_stream("u1").await);
        assert_eq!(registry.send_to_user("u1", &frame()).await, 0);
    }

    #[tokio::test]
    async fn blocked_stream_is_torn_down_after_the_write_budget() {
        let registry = StreamRegistry::new(1, Duration::from_millis(20));
        // One frame fills the queue; the receiver never drains it.
        let _rx = registry.attach("u1", "c1").await;
        assert_eq!(registry.send_to_user("u1", &frame()).await, 1);
        // The queue is full and nobody reads: budget expires, stream closes.
        assert_eq!(registry.send_to_user("u1", &frame()).await, 0);
        assert!(!registry.has_stream("u1").await);
    }

    #[tokio::test]
    async fn dropped_receiver_counts_as_dead() {
        let registry = StreamRegistry::new(8, Duration::from_millis(100));
        let rx = registry.attach("u1", "c1").await;
        drop(rx);
        assert_eq!(registry.send_to_user("u1", &frame()).await, 0);
        assert!(!registry.has_stream("u1").await);
    }
}
