//! In-memory grid backend.
//!
//! `RwLock`-guarded maps with a version counter per connection slot for CAS,
//! and a `tokio::sync::broadcast` channel as the continuous-query feed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use beacon_protocol::{Broadcast, MessageDeliveryEvent, ReadStatus, RemovalReason};
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use super::{
    ConnectionInfo, GridCache, GridEvent, GridEventKind, HeartbeatEntry, InboxEntry,
    VersionedConnections,
};
use crate::error::CoreResult;

const EVENT_CHANNEL_CAPACITY: usize = 4096;

struct VersionedSlot {
    version: u64,
    connections: HashMap<String, ConnectionInfo>,
}

struct PendingEntry {
    event: MessageDeliveryEvent,
    expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct MemoryGrid {
    connections: Arc<RwLock<HashMap<String, VersionedSlot>>>,
    heartbeats: Arc<RwLock<HashMap<String, HeartbeatEntry>>>,
    inboxes: Arc<RwLock<HashMap<String, Vec<InboxEntry>>>>,
    content: Arc<RwLock<HashMap<Uuid, Broadcast>>>,
    pending: Arc<RwLock<HashMap<String, VecDeque<PendingEntry>>>>,
    events: broadcast::Sender<GridEvent>,
}

impl Default for MemoryGrid {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        MemoryGrid {
            connections: Arc::new(RwLock::new(HashMap::new())),
            heartbeats: Arc::new(RwLock::new(HashMap::new())),
            inboxes: Arc::new(RwLock::new(HashMap::new())),
            content: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }
}

impl MemoryGrid {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&self, event: GridEvent) {
        // No subscribers is fine; the send result only reports that.
        let _ = self.events.send(event);
    }
}

#[async_trait::async_trait]
impl GridCache for MemoryGrid {
    async fn user_connections(&self, user_id: &str) -> CoreResult<Option<VersionedConnections>> {
        Ok(self
            .connections
            .read()
            .await
            .get(user_id)
            .map(|slot| VersionedConnections {
                version: slot.version,
                connections: slot.connections.clone(),
            }))
    }

    async fn cas_user_connections(
        &self,
        user_id: &str,
        expected_version: Option<u64>,
        connections: HashMap<String, ConnectionInfo>,
    ) -> CoreResult<bool> {
        let mut map = self.connections.write().await;
        match expected_version {
            None => {
                if map.contains_key(user_id) {
                    return Ok(false);
                }
                if !connections.is_empty() {
                    map.insert(
                        user_id.to_owned(),
                        VersionedSlot {
                            version: 1,
                            connections,
                        },
                    );
                }
                Ok(true)
            }
            Some(expected) => {
                let version = match map.get(user_id) {
                    Some(slot) => slot.version,
                    None => return Ok(false),
                };
                if version != expected {
                    return Ok(false);
                }
                if connections.is_empty() {
                    map.remove(user_id);
                } else {
                    let slot = map.get_mut(user_id).expect("checked above");
                    slot.version += 1;
                    slot.connections = connections;
                }
                Ok(true)
            }
        }
    }

    async fn online_users(&self) -> CoreResult<Vec<String>> {
        Ok(self.connections.read().await.keys().cloned().collect())
    }

    async fn connection_counts(&self) -> CoreResult<(usize, usize)> {
        let map = self.connections.read().await;
        let connections = map.values().map(|slot| slot.connections.len()).sum();
        Ok((map.len(), connections))
    }

    async fn heartbeat(&self, connection_id: &str) -> CoreResult<Option<HeartbeatEntry>> {
        Ok(self.heartbeats.read().await.get(connection_id).cloned())
    }

    async fn put_heartbeat(&self, connection_id: &str, entry: HeartbeatEntry) -> CoreResult<()> {
        self.heartbeats
            .write()
            .await
            .insert(connection_id.to_owned(), entry);
        Ok(())
    }

    async fn remove_heartbeat(&self, connection_id: &str) -> CoreResult<()> {
        self.heartbeats.write().await.remove(connection_id);
        Ok(())
    }

    async fn bump_heartbeats(&self, connection_ids: &[String], epoch: i64) -> CoreResult<()> {
        let mut map = self.heartbeats.write().await;
        for id in connection_ids {
            if let Some(entry) = map.get_mut(id) {
                entry.last_heartbeat_epoch = epoch;
            }
        }
        Ok(())
    }

    async fn stale_connections(&self, cutoff_epoch: i64) -> CoreResult<Vec<(String, String)>> {
        Ok(self
            .heartbeats
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.last_heartbeat_epoch < cutoff_epoch)
            .map(|(id, entry)| (id.clone(), entry.user_id.clone()))
            .collect())
    }

    async fn push_inbox(&self, user_id: &str, entry: InboxEntry) -> CoreResult<()> {
        let broadcast_id = entry.broadcast_id;
        {
            let mut inboxes = self.inboxes.write().await;
            let inbox = inboxes.entry(user_id.to_owned()).or_default();
            inbox.insert(0, entry);
        }
        self.emit(GridEvent {
            user_id: user_id.to_owned(),
            broadcast_id,
            kind: GridEventKind::Message,
            removal_reason: None,
        });
        Ok(())
    }

    async fn mark_inbox_read(&self, user_id: &str, broadcast_id: Uuid) -> CoreResult<()> {
        {
            let mut inboxes = self.inboxes.write().await;
            if let Some(inbox) = inboxes.get_mut(user_id) {
                for entry in inbox.iter_mut().filter(|e| e.broadcast_id == broadcast_id) {
                    entry.read_status = ReadStatus::Read;
                }
            }
        }
        self.emit(GridEvent {
            user_id: user_id.to_owned(),
            broadcast_id,
            kind: GridEventKind::ReadReceipt,
            removal_reason: None,
        });
        Ok(())
    }

    async fn remove_inbox(
        &self,
        user_id: &str,
        broadcast_id: Uuid,
        reason: RemovalReason,
    ) -> CoreResult<()> {
        {
            let mut inboxes = self.inboxes.write().await;
            if let Some(inbox) = inboxes.get_mut(user_id) {
                inbox.retain(|entry| entry.broadcast_id != broadcast_id);
                if inbox.is_empty() {
                    inboxes.remove(user_id);
                }
            }
        }
        self.emit(GridEvent {
            user_id: user_id.to_owned(),
            broadcast_id,
            kind: GridEventKind::MessageRemoved,
            removal_reason: Some(reason),
        });
        Ok(())
    }

    async fn read_inbox(&self, user_id: &str, limit: usize) -> CoreResult<Vec<InboxEntry>> {
        Ok(self
            .inboxes
            .read()
            .await
            .get(user_id)
            .map(|inbox| inbox.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn evict_inbox(&self, user_id: &str) -> CoreResult<()> {
        self.inboxes.write().await.remove(user_id);
        Ok(())
    }

    async fn cache_broadcast(&self, broadcast: Broadcast) -> CoreResult<()> {
        self.content.write().await.insert(broadcast.id, broadcast);
        Ok(())
    }

    async fn cached_broadcast(&self, id: Uuid) -> CoreResult<Option<Broadcast>> {
        Ok(self.content.read().await.get(&id).cloned())
    }

    async fn evict_broadcast(&self, id: Uuid) -> CoreResult<()> {
        self.content.write().await.remove(&id);
        Ok(())
    }

    async fn enqueue_pending(
        &self,
        user_id: &str,
        event: MessageDeliveryEvent,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.pending
            .write()
            .await
            .entry(user_id.to_owned())
            .or_default()
            .push_back(PendingEntry { event, expires_at });
        Ok(())
    }

    async fn drain_pending(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<MessageDeliveryEvent>> {
        let Some(queue) = self.pending.write().await.remove(user_id) else {
            return Ok(Vec::new());
        };
        Ok(queue
            .into_iter()
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.event)
            .collect())
    }

    fn watch_events(&self) -> broadcast::Receiver<GridEvent> {
        self.events.subscribe()
    }
}
