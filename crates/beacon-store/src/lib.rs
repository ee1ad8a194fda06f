//! PostgreSQL implementation of the durable store.
//!
//! Repo-style runtime queries over a `PgPool`; every multi-row operation —
//! business change plus its outbox events, status flip plus row supersedes —
//! runs in one transaction.  `sqlx::Error` is translated to the domain
//! taxonomy at this boundary (`StoreUnavailable` for infrastructure,
//! `SerializationPoison` for unreadable column data).

use async_trait::async_trait;
use beacon_core::error::{CoreError, CoreResult};
use beacon_core::lifecycle;
use beacon_core::store::{
    lifecycle_outbox_insert, BroadcastFilter, BroadcastStats, BroadcastStore, DeliveryRow,
    DltRecord, NewBroadcast, OutboxDrain, OutboxEvent, OutboxInsert, OutboxSink, UserMessage,
};
use beacon_protocol::{
    Broadcast, BroadcastStatus, DeliveryEventType, DeliveryStatus, Priority, ReadStatus,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::warn;
use uuid::Uuid;

pub async fn create_pool(database_url: &str) -> PgPool {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .expect("failed to connect to Postgres")
}

pub async fn run_migrations(pool: &PgPool) {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .expect("failed to run database migrations")
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn store_err(e: sqlx::Error) -> CoreError {
    CoreError::StoreUnavailable(e.to_string())
}

fn parse_status(s: &str) -> CoreResult<BroadcastStatus> {
    match s {
        "PREPARING" => Ok(BroadcastStatus::Preparing),
        "READY" => Ok(BroadcastStatus::Ready),
        "SCHEDULED" => Ok(BroadcastStatus::Scheduled),
        "ACTIVE" => Ok(BroadcastStatus::Active),
        "EXPIRED" => Ok(BroadcastStatus::Expired),
        "CANCELLED" => Ok(BroadcastStatus::Cancelled),
        "FAILED" => Ok(BroadcastStatus::Failed),
        other => Err(CoreError::SerializationPoison(format!(
            "unknown broadcast status '{other}'"
        ))),
    }
}

fn parse_priority(s: &str) -> CoreResult<Priority> {
    match s {
        "LOW" => Ok(Priority::Low),
        "NORMAL" => Ok(Priority::Normal),
        "HIGH" => Ok(Priority::High),
        "URGENT" => Ok(Priority::Urgent),
        other => Err(CoreError::SerializationPoison(format!(
            "unknown priority '{other}'"
        ))),
    }
}

fn parse_delivery_status(s: &str) -> CoreResult<DeliveryStatus> {
    match s {
        "PENDING" => Ok(DeliveryStatus::Pending),
        "DELIVERED" => Ok(DeliveryStatus::Delivered),
        "FAILED" => Ok(DeliveryStatus::Failed),
        "SUPERSEDED" => Ok(DeliveryStatus::Superseded),
        other => Err(CoreError::SerializationPoison(format!(
            "unknown delivery status '{other}'"
        ))),
    }
}

fn parse_read_status(s: &str) -> CoreResult<ReadStatus> {
    match s {
        "UNREAD" => Ok(ReadStatus::Unread),
        "READ" => Ok(ReadStatus::Read),
        other => Err(CoreError::SerializationPoison(format!(
            "unknown read status '{other}'"
        ))),
    }
}

fn broadcast_from_row(row: &PgRow) -> CoreResult<Broadcast> {
    let target: String = row.get("target");
    Ok(Broadcast {
        id: row.get("id"),
        sender: row.get("sender"),
        content: row.get("content"),
        priority: parse_priority(&row.get::<String, _>("priority"))?,
        category: row.get("category"),
        target: serde_json::from_str(&target)?,
        scheduled_at: row.get("scheduled_at"),
        expires_at: row.get("expires_at"),
        fire_and_forget: row.get("fire_and_forget"),
        status: parse_status(&row.get::<String, _>("status"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn delivery_from_row(row: &PgRow) -> CoreResult<DeliveryRow> {
    Ok(DeliveryRow {
        broadcast_id: row.get("broadcast_id"),
        user_id: row.get("user_id"),
        delivery_status: parse_delivery_status(&row.get::<String, _>("delivery_status"))?,
        read_status: parse_read_status(&row.get::<String, _>("read_status"))?,
        delivered_at: row.get("delivered_at"),
        read_at: row.get("read_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const BROADCAST_COLUMNS: &str = "id, sender, content, priority, category, target, scheduled_at, \
                                 expires_at, fire_and_forget, status, created_at, updated_at";

async fn insert_outbox_tx(
    tx: &mut Transaction<'_, Postgres>,
    events: &[OutboxInsert],
) -> Result<(), sqlx::Error> {
    for event in events {
        sqlx::query(
            "INSERT INTO outbox_events (id, aggregate_id, event_type, topic, payload) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.topic)
        .bind(&event.payload)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn bump_stat_tx(
    tx: &mut Transaction<'_, Postgres>,
    broadcast_id: Uuid,
    column: &str,
    delta: i64,
) -> Result<(), sqlx::Error> {
    // `column` is one of our four fixed counter names, never user input.
    let sql = format!(
        "INSERT INTO broadcast_statistics (broadcast_id, {column}) VALUES ($1, $2) \
         ON CONFLICT (broadcast_id) DO UPDATE SET {column} = broadcast_statistics.{column} + $2"
    );
    sqlx::query(&sql)
        .bind(broadcast_id)
        .bind(delta)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn fetch_broadcast_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    for_update: bool,
) -> CoreResult<Option<Broadcast>> {
    let sql = if for_update {
        format!("SELECT {BROADCAST_COLUMNS} FROM broadcast_messages WHERE id = $1 FOR UPDATE")
    } else {
        format!("SELECT {BROADCAST_COLUMNS} FROM broadcast_messages WHERE id = $1")
    };
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(store_err)?;
    row.as_ref().map(broadcast_from_row).transpose()
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl BroadcastStore for PgStore {
    async fn insert_broadcast(
        &self,
        new: NewBroadcast,
        status: BroadcastStatus,
        events: &[OutboxInsert],
    ) -> CoreResult<Broadcast> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let id = new.id;
        let target_json = serde_json::to_string(&new.target)?;
        let target_type = match &new.target {
            beacon_protocol::TargetSpec::All => "ALL",
            beacon_protocol::TargetSpec::Role { .. } => "ROLE",
            beacon_protocol::TargetSpec::Product { .. } => "PRODUCT",
            beacon_protocol::TargetSpec::Selected { .. } => "SELECTED",
        };
        let priority = match new.priority {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Urgent => "URGENT",
        };

        let row = sqlx::query(
            "INSERT INTO broadcast_messages \
                 (id, sender, content, priority, category, target_type, target, \
                  scheduled_at, expires_at, fire_and_forget, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING created_at, updated_at",
        )
        .bind(id)
        .bind(&new.sender)
        .bind(&new.content)
        .bind(priority)
        .bind(&new.category)
        .bind(target_type)
        .bind(&target_json)
        .bind(new.scheduled_at)
        .bind(new.expires_at)
        .bind(new.fire_and_forget)
        .bind(status.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(store_err)?;

        sqlx::query("INSERT INTO broadcast_statistics (broadcast_id) VALUES ($1)")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        insert_outbox_tx(&mut tx, events).await.map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;

        Ok(Broadcast {
            id,
            sender: new.sender,
            content: new.content,
            priority: new.priority,
            category: new.category,
            target: new.target,
            scheduled_at: new.scheduled_at,
            expires_at: new.expires_at,
            fire_and_forget: new.fire_and_forget,
            status,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn broadcast(&self, id: Uuid) -> CoreResult<Option<Broadcast>> {
        let sql = format!("SELECT {BROADCAST_COLUMNS} FROM broadcast_messages WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(broadcast_from_row).transpose()
    }

    async fn list_broadcasts(
        &self,
        filter: BroadcastFilter,
        limit: i64,
    ) -> CoreResult<Vec<Broadcast>> {
        let clause = match filter {
            BroadcastFilter::All => "",
            BroadcastFilter::Active => "WHERE status = 'ACTIVE'",
            BroadcastFilter::Scheduled => "WHERE status = 'SCHEDULED'",
        };
        let sql = format!(
            "SELECT {BROADCAST_COLUMNS} FROM broadcast_messages {clause} \
             ORDER BY created_at DESC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(broadcast_from_row).collect()
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[BroadcastStatus],
        to: BroadcastStatus,
        events: &[OutboxInsert],
    ) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let from_strings: Vec<String> = from.iter().map(|s| s.as_str().to_owned()).collect();
        let result = sqlx::query(
            "UPDATE broadcast_messages SET status = $2, updated_at = now() \
             WHERE id = $1 AND status = ANY($3)",
        )
        .bind(id)
        .bind(to.as_str())
        .bind(&from_strings)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM broadcast_messages WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(store_err)?;
            if exists.is_none() {
                return Err(CoreError::NotFound(format!("broadcast {id}")));
            }
            return Ok(false);
        }
        insert_outbox_tx(&mut tx, events).await.map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(true)
    }

    async fn activate_precomputed(&self, id: Uuid, topic: &str) -> CoreResult<Option<u64>> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let Some(broadcast) = fetch_broadcast_tx(&mut tx, id, true).await? else {
            return Err(CoreError::NotFound(format!("broadcast {id}")));
        };
        if broadcast.status != BroadcastStatus::Ready {
            return Ok(None);
        }

        sqlx::query(
            "UPDATE broadcast_messages SET status = 'ACTIVE', updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        let rows = sqlx::query(
            "SELECT user_id FROM user_broadcast_messages \
             WHERE broadcast_id = $1 AND delivery_status = 'PENDING' ORDER BY user_id",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(store_err)?;

        let now = Utc::now();
        let events: Vec<OutboxInsert> = rows
            .iter()
            .map(|row| {
                let user: String = row.get("user_id");
                lifecycle_outbox_insert(&broadcast, &user, DeliveryEventType::Created, topic, now)
            })
            .collect();
        insert_outbox_tx(&mut tx, &events).await.map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(Some(events.len() as u64))
    }

    async fn supersede(
        &self,
        id: Uuid,
        to: BroadcastStatus,
        event_type: DeliveryEventType,
        topic: &str,
    ) -> CoreResult<Option<u64>> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let Some(broadcast) = fetch_broadcast_tx(&mut tx, id, true).await? else {
            return Err(CoreError::NotFound(format!("broadcast {id}")));
        };
        if !lifecycle::can_transition(broadcast.status, to) {
            return Ok(None);
        }

        sqlx::query(
            "UPDATE broadcast_messages SET status = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(to.as_str())
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        let superseded = sqlx::query(
            "UPDATE user_broadcast_messages \
             SET delivery_status = 'SUPERSEDED', updated_at = now() \
             WHERE broadcast_id = $1 AND delivery_status = 'PENDING'",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?
        .rows_affected();

        // Every row gets a removal event, delivered rows included: workers
        // must clear grids and push MESSAGE_REMOVED to open streams.
        let rows = sqlx::query(
            "SELECT user_id FROM user_broadcast_messages WHERE broadcast_id = $1 ORDER BY user_id",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(store_err)?;

        let now = Utc::now();
        let events: Vec<OutboxInsert> = rows
            .iter()
            .map(|row| {
                let user: String = row.get("user_id");
                lifecycle_outbox_insert(&broadcast, &user, event_type, topic, now)
            })
            .collect();
        insert_outbox_tx(&mut tx, &events).await.map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(Some(superseded))
    }

    async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        fan_out_on_write: bool,
        limit: i64,
    ) -> CoreResult<Vec<Broadcast>> {
        let sql = format!(
            "SELECT {BROADCAST_COLUMNS} FROM broadcast_messages \
             WHERE status = 'SCHEDULED' AND scheduled_at <= $1 \
               AND (target_type = 'PRODUCT') = $2 \
             ORDER BY scheduled_at ASC LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(fan_out_on_write)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(broadcast_from_row).collect()
    }

    async fn ready_broadcasts(&self, limit: i64) -> CoreResult<Vec<Broadcast>> {
        let sql = format!(
            "SELECT {BROADCAST_COLUMNS} FROM broadcast_messages \
             WHERE status = 'READY' ORDER BY updated_at ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(broadcast_from_row).collect()
    }

    async fn expired_active(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> CoreResult<Vec<Broadcast>> {
        let sql = format!(
            "SELECT {BROADCAST_COLUMNS} FROM broadcast_messages \
             WHERE status = 'ACTIVE' AND expires_at IS NOT NULL AND expires_at <= $1 \
             ORDER BY expires_at ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(broadcast_from_row).collect()
    }

    async fn insert_delivery_batch(
        &self,
        broadcast_id: Uuid,
        user_ids: &[String],
    ) -> CoreResult<u64> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let mut inserted = 0u64;
        for user_id in user_ids {
            let result = sqlx::query(
                "INSERT INTO user_broadcast_messages (broadcast_id, user_id) \
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(broadcast_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
            inserted += result.rows_affected();
        }
        if inserted > 0 {
            bump_stat_tx(&mut tx, broadcast_id, "total_targeted", inserted as i64)
                .await
                .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(inserted)
    }

    async fn mark_delivered(&self, broadcast_id: Uuid, user_id: &str) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let result = sqlx::query(
            "UPDATE user_broadcast_messages \
             SET delivery_status = 'DELIVERED', delivered_at = now(), updated_at = now() \
             WHERE broadcast_id = $1 AND user_id = $2 AND delivery_status = 'PENDING'",
        )
        .bind(broadcast_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        bump_stat_tx(&mut tx, broadcast_id, "total_delivered", 1)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(true)
    }

    async fn mark_delivery_failed(&self, broadcast_id: Uuid, user_id: &str) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let result = sqlx::query(
            "UPDATE user_broadcast_messages \
             SET delivery_status = 'FAILED', updated_at = now() \
             WHERE broadcast_id = $1 AND user_id = $2 AND delivery_status = 'PENDING'",
        )
        .bind(broadcast_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        bump_stat_tx(&mut tx, broadcast_id, "total_failed", 1)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(true)
    }

    async fn mark_read(
        &self,
        broadcast_id: Uuid,
        user_id: &str,
        events: &[OutboxInsert],
    ) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let exists = sqlx::query(
            "SELECT 1 FROM user_broadcast_messages WHERE broadcast_id = $1 AND user_id = $2",
        )
        .bind(broadcast_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;
        if exists.is_none() {
            return Err(CoreError::NotFound(format!(
                "delivery {broadcast_id}/{user_id}"
            )));
        }

        let result = sqlx::query(
            "UPDATE user_broadcast_messages \
             SET read_status = 'READ', read_at = now(), updated_at = now() \
             WHERE broadcast_id = $1 AND user_id = $2 AND read_status = 'UNREAD'",
        )
        .bind(broadcast_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        bump_stat_tx(&mut tx, broadcast_id, "total_read", 1)
            .await
            .map_err(store_err)?;
        insert_outbox_tx(&mut tx, events).await.map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(true)
    }

    async fn mark_all_read(&self, user_id: &str, topic: &str) -> CoreResult<Vec<Uuid>> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let rows = sqlx::query(
            "UPDATE user_broadcast_messages \
             SET read_status = 'READ', read_at = now(), updated_at = now() \
             WHERE user_id = $1 AND read_status = 'UNREAD' \
             RETURNING broadcast_id",
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(store_err)?;

        let now = Utc::now();
        let mut changed = Vec::with_capacity(rows.len());
        for row in &rows {
            let broadcast_id: Uuid = row.get("broadcast_id");
            bump_stat_tx(&mut tx, broadcast_id, "total_read", 1)
                .await
                .map_err(store_err)?;
            if let Some(broadcast) = fetch_broadcast_tx(&mut tx, broadcast_id, false).await? {
                let event =
                    lifecycle_outbox_insert(&broadcast, user_id, DeliveryEventType::Read, topic, now);
                insert_outbox_tx(&mut tx, std::slice::from_ref(&event))
                    .await
                    .map_err(store_err)?;
            }
            changed.push(broadcast_id);
        }
        tx.commit().await.map_err(store_err)?;
        Ok(changed)
    }

    async fn reset_delivery(&self, broadcast_id: Uuid, user_id: &str) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let row = sqlx::query(
            "SELECT delivery_status FROM user_broadcast_messages \
             WHERE broadcast_id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(broadcast_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;
        let Some(row) = row else {
            return Ok(false);
        };
        let status = parse_delivery_status(&row.get::<String, _>("delivery_status"))?;
        if status == DeliveryStatus::Pending {
            return Ok(true);
        }
        sqlx::query(
            "UPDATE user_broadcast_messages \
             SET delivery_status = 'PENDING', delivered_at = NULL, updated_at = now() \
             WHERE broadcast_id = $1 AND user_id = $2",
        )
        .bind(broadcast_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        if status == DeliveryStatus::Delivered {
            bump_stat_tx(&mut tx, broadcast_id, "total_delivered", -1)
                .await
                .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(true)
    }

    async fn deliveries(
        &self,
        broadcast_id: Uuid,
        status: Option<DeliveryStatus>,
        limit: i64,
        offset: i64,
    ) -> CoreResult<Vec<DeliveryRow>> {
        let rows = sqlx::query(
            "SELECT broadcast_id, user_id, delivery_status, read_status, delivered_at, read_at, \
                    created_at, updated_at \
             FROM user_broadcast_messages \
             WHERE broadcast_id = $1 AND ($2::text IS NULL OR delivery_status = $2) \
             ORDER BY user_id ASC LIMIT $3 OFFSET $4",
        )
        .bind(broadcast_id)
        .bind(status.map(DeliveryStatus::as_str))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(delivery_from_row).collect()
    }

    async fn user_messages(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: i64,
    ) -> CoreResult<Vec<UserMessage>> {
        let sql = format!(
            "SELECT b.id, b.sender, b.content, b.priority, b.category, b.target, \
                    b.scheduled_at, b.expires_at, b.fire_and_forget, b.status, \
                    b.created_at, b.updated_at, \
                    u.delivery_status AS u_delivery_status, u.read_status AS u_read_status, \
                    u.created_at AS u_created_at \
             FROM user_broadcast_messages u \
             JOIN broadcast_messages b ON b.id = u.broadcast_id \
             WHERE u.user_id = $1 AND u.delivery_status <> 'SUPERSEDED' \
               AND ($2 = false OR u.read_status = 'UNREAD') \
             ORDER BY u.created_at DESC LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(unread_only)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter()
            .map(|row| {
                Ok(UserMessage {
                    broadcast: broadcast_from_row(row)?,
                    delivery_status: parse_delivery_status(
                        &row.get::<String, _>("u_delivery_status"),
                    )?,
                    read_status: parse_read_status(&row.get::<String, _>("u_read_status"))?,
                    created_at: row.get("u_created_at"),
                })
            })
            .collect()
    }

    async fn undelivered_for_user(&self, user_id: &str) -> CoreResult<Vec<Broadcast>> {
        let sql = format!(
            "SELECT {columns} \
             FROM user_broadcast_messages u \
             JOIN broadcast_messages b ON b.id = u.broadcast_id \
             WHERE u.user_id = $1 AND u.delivery_status = 'PENDING' AND b.status = 'ACTIVE' \
             ORDER BY b.created_at ASC",
            columns = "b.id, b.sender, b.content, b.priority, b.category, b.target, \
                       b.scheduled_at, b.expires_at, b.fire_and_forget, b.status, \
                       b.created_at, b.updated_at"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(broadcast_from_row).collect()
    }

    async fn stats(&self, broadcast_id: Uuid) -> CoreResult<BroadcastStats> {
        let row = sqlx::query(
            "SELECT total_targeted, total_delivered, total_read, total_failed \
             FROM broadcast_statistics WHERE broadcast_id = $1",
        )
        .bind(broadcast_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row
            .map(|r| BroadcastStats {
                total_targeted: r.get("total_targeted"),
                total_delivered: r.get("total_delivered"),
                total_read: r.get("total_read"),
                total_failed: r.get("total_failed"),
            })
            .unwrap_or_default())
    }

    async fn drain_outbox(&self, limit: i64, sink: &dyn OutboxSink) -> CoreResult<OutboxDrain> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        // The lock is held until commit: a lease handover mid-batch skips
        // these rows instead of double-publishing them.
        let rows = sqlx::query(
            "SELECT id, aggregate_id, event_type, topic, payload, created_at \
             FROM outbox_events ORDER BY seq ASC LIMIT $1 FOR UPDATE SKIP LOCKED",
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(store_err)?;

        let mut drain = OutboxDrain::default();
        let mut published_ids: Vec<Uuid> = Vec::new();
        for row in &rows {
            let event = OutboxEvent {
                id: row.get("id"),
                aggregate_id: row.get("aggregate_id"),
                event_type: row.get("event_type"),
                topic: row.get("topic"),
                payload: row.get("payload"),
                created_at: row.get("created_at"),
            };
            if serde_json::from_str::<serde_json::Value>(&event.payload).is_err() {
                warn!(
                    outbox_id = %event.id,
                    aggregate_id = %event.aggregate_id,
                    "poison outbox payload, quarantining"
                );
                sqlx::query(
                    "INSERT INTO outbox_poison \
                         (id, aggregate_id, event_type, topic, payload, reason) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(event.id)
                .bind(&event.aggregate_id)
                .bind(&event.event_type)
                .bind(&event.topic)
                .bind(&event.payload)
                .bind("payload failed to deserialize")
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
                sqlx::query("DELETE FROM outbox_events WHERE id = $1")
                    .bind(event.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(store_err)?;
                drain.quarantined += 1;
                continue;
            }
            // A publish failure drops the transaction: every row (and the
            // quarantine moves) stays put for the next tick.
            sink.publish(&event).await?;
            published_ids.push(event.id);
            drain.published += 1;
        }

        if !published_ids.is_empty() {
            sqlx::query("DELETE FROM outbox_events WHERE id = ANY($1)")
                .bind(&published_ids)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(drain)
    }

    async fn outbox_depth(&self) -> CoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS depth FROM outbox_events")
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.get("depth"))
    }

    async fn insert_dlt(&self, record: DltRecord) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO dlt_messages \
                 (id, original_topic, log_partition, log_offset, record_key, \
                  fail_title, fail_detail, payload, failed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(record.id)
        .bind(&record.original_topic)
        .bind(record.partition)
        .bind(record.offset)
        .bind(&record.key)
        .bind(&record.fail_title)
        .bind(&record.fail_detail)
        .bind(&record.payload)
        .bind(record.failed_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list_dlt(&self, limit: i64) -> CoreResult<Vec<DltRecord>> {
        let rows = sqlx::query(
            "SELECT id, original_topic, log_partition, log_offset, record_key, \
                    fail_title, fail_detail, payload, failed_at \
             FROM dlt_messages ORDER BY failed_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.iter().map(dlt_from_row).collect())
    }

    async fn dlt_record(&self, id: Uuid) -> CoreResult<Option<DltRecord>> {
        let row = sqlx::query(
            "SELECT id, original_topic, log_partition, log_offset, record_key, \
                    fail_title, fail_detail, payload, failed_at \
             FROM dlt_messages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.as_ref().map(dlt_from_row))
    }

    async fn delete_dlt(&self, id: Uuid) -> CoreResult<bool> {
        let result = sqlx::query("DELETE FROM dlt_messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_dlt(&self) -> CoreResult<u64> {
        let result = sqlx::query("DELETE FROM dlt_messages")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected())
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO scheduler_leases (name, holder, locked_until) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO UPDATE \
                 SET holder = EXCLUDED.holder, locked_until = EXCLUDED.locked_until \
             WHERE scheduler_leases.holder = EXCLUDED.holder \
                OR scheduler_leases.locked_until <= $4",
        )
        .bind(name)
        .bind(holder)
        .bind(until)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> CoreResult<()> {
        sqlx::query("DELETE FROM scheduler_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

fn dlt_from_row(row: &PgRow) -> DltRecord {
    DltRecord {
        id: row.get("id"),
        original_topic: row.get("original_topic"),
        partition: row.get("log_partition"),
        offset: row.get("log_offset"),
        key: row.get("record_key"),
        fail_title: row.get("fail_title"),
        fail_detail: row.get("fail_detail"),
        payload: row.get("payload"),
        failed_at: row.get("failed_at"),
    }
}
