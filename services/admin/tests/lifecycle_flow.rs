//! Lifecycle integration: creation modes, precompute, activation,
//! cancellation — over the in-memory store and log.

use std::sync::Arc;
use std::time::Duration;

use admin::outbox::OutboxPoller;
use admin::AppState;
use beacon_core::config::Settings;
use beacon_core::directory::StaticDirectory;
use beacon_core::grid::memory::MemoryGrid;
use beacon_core::log::memory::MemoryLog;
use beacon_core::log::{EventLog, LogConsumer};
use beacon_core::store::memory::MemoryStore;
use beacon_core::store::{BroadcastStore, NewBroadcast};
use beacon_core::CoreError;
use beacon_protocol::{
    BroadcastStatus, DeliveryStatus, MessageDeliveryEvent, Priority, TargetSpec,
};
use chrono::Utc;
use uuid::Uuid;

struct Harness {
    state: AppState,
    store: Arc<MemoryStore>,
    log: Arc<MemoryLog>,
}

async fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let log = Arc::new(MemoryLog::new());
    let grid = Arc::new(MemoryGrid::new());
    let directory = Arc::new(StaticDirectory::new());
    for i in 0..4 {
        directory
            .upsert_user(&format!("u{i}"), &["member"], &["alpha"])
            .await;
    }
    let settings = Arc::new(Settings::from_lookup(|_| None).unwrap());
    let state = AppState::new(store.clone(), log.clone(), grid, directory, settings);
    Harness { state, store, log }
}

fn new_broadcast(target: TargetSpec) -> NewBroadcast {
    NewBroadcast {
        id: Uuid::new_v4(),
        sender: "ops".to_owned(),
        content: "maintenance at noon".to_owned(),
        priority: Priority::High,
        category: Some("infra".to_owned()),
        target,
        scheduled_at: None,
        expires_at: None,
        fire_and_forget: false,
    }
}

#[tokio::test]
async fn immediate_selected_broadcast_goes_active_with_one_group_event() {
    let h = harness().await;
    let broadcast = h
        .state
        .lifecycle
        .create(new_broadcast(TargetSpec::Selected {
            user_ids: vec!["u0".to_owned(), "u1".to_owned(), "u0".to_owned()],
        }))
        .await
        .unwrap();

    assert_eq!(broadcast.status, BroadcastStatus::Active);
    // Dedup happened before storage.
    match &broadcast.target {
        TargetSpec::Selected { user_ids } => assert_eq!(user_ids, &["u0", "u1"]),
        other => panic!("expected SELECTED, got {other:?}"),
    }
    assert_eq!(h.store.outbox_depth().await.unwrap(), 1);

    let poller = OutboxPoller::new(
        h.store.clone(),
        h.log.clone(),
        100,
        Duration::from_secs(1),
    );
    poller.tick().await.unwrap();
    assert_eq!(h.log.topic_len("broadcast-orchestration").await, 1);

    // The group event routes by broadcast id and names no user.
    let mut consumer = h
        .log
        .subscribe("broadcast-orchestration", "test")
        .await
        .unwrap();
    let record = consumer
        .poll(Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.key, broadcast.id.to_string());
    let event: MessageDeliveryEvent = serde_json::from_slice(&record.payload).unwrap();
    assert_eq!(event.broadcast_id, broadcast.id);
    assert_eq!(event.user_id, None);
}

#[tokio::test]
async fn product_broadcast_precomputes_then_activates_per_user() {
    let h = harness().await;
    let broadcast = h
        .state
        .lifecycle
        .create(new_broadcast(TargetSpec::Product {
            product: "alpha".to_owned(),
        }))
        .await
        .unwrap();
    assert_eq!(broadcast.status, BroadcastStatus::Preparing);
    // Creation emits nothing: write-fanout waits for precompute.
    assert_eq!(h.store.outbox_depth().await.unwrap(), 0);

    let targeted = h.state.lifecycle.precompute(&broadcast).await.unwrap();
    assert_eq!(targeted, 4);
    assert_eq!(
        h.store.broadcast(broadcast.id).await.unwrap().unwrap().status,
        BroadcastStatus::Ready
    );

    h.state.lifecycle.activate_due(Utc::now()).await.unwrap();
    assert_eq!(
        h.store.broadcast(broadcast.id).await.unwrap().unwrap().status,
        BroadcastStatus::Active
    );
    // One CREATED event per precomputed row, keyed per user.
    assert_eq!(h.store.outbox_depth().await.unwrap(), 4);
    assert_eq!(h.store.stats(broadcast.id).await.unwrap().total_targeted, 4);
}

#[tokio::test]
async fn scheduled_broadcast_waits_for_its_due_time() {
    let h = harness().await;
    let mut new = new_broadcast(TargetSpec::All);
    new.scheduled_at = Some(Utc::now() + chrono::Duration::seconds(30));
    let broadcast = h.state.lifecycle.create(new).await.unwrap();
    assert_eq!(broadcast.status, BroadcastStatus::Scheduled);

    // Not due yet.
    h.state.lifecycle.activate_due(Utc::now()).await.unwrap();
    assert_eq!(
        h.store.broadcast(broadcast.id).await.unwrap().unwrap().status,
        BroadcastStatus::Scheduled
    );

    // Past the due time a single group event activates it.
    h.state
        .lifecycle
        .activate_due(Utc::now() + chrono::Duration::seconds(31))
        .await
        .unwrap();
    assert_eq!(
        h.store.broadcast(broadcast.id).await.unwrap().unwrap().status,
        BroadcastStatus::Active
    );
    assert_eq!(h.store.outbox_depth().await.unwrap(), 1);
}

#[tokio::test]
async fn scheduled_product_broadcast_goes_through_preparing() {
    let h = harness().await;
    let mut new = new_broadcast(TargetSpec::Product {
        product: "alpha".to_owned(),
    });
    new.scheduled_at = Some(Utc::now() - chrono::Duration::seconds(1));
    let broadcast = h.state.lifecycle.create(new).await.unwrap();
    assert_eq!(broadcast.status, BroadcastStatus::Scheduled);

    h.state.lifecycle.precompute_due(Utc::now()).await.unwrap();
    assert_eq!(
        h.store.broadcast(broadcast.id).await.unwrap().unwrap().status,
        BroadcastStatus::Ready
    );

    h.state.lifecycle.activate_due(Utc::now()).await.unwrap();
    let after = h.store.broadcast(broadcast.id).await.unwrap().unwrap();
    assert_eq!(after.status, BroadcastStatus::Active);
    assert_eq!(h.store.stats(broadcast.id).await.unwrap().total_targeted, 4);
}

#[tokio::test]
async fn cancel_supersedes_pending_rows_and_is_terminal() {
    let h = harness().await;
    let broadcast = h
        .state
        .lifecycle
        .create(new_broadcast(TargetSpec::Selected {
            user_ids: vec!["u0".to_owned(), "u1".to_owned()],
        }))
        .await
        .unwrap();
    // The consumer resolved the audience and wrote rows; u0 got delivered.
    h.store
        .insert_delivery_batch(broadcast.id, &["u0".to_owned(), "u1".to_owned()])
        .await
        .unwrap();
    h.store.mark_delivered(broadcast.id, "u0").await.unwrap();
    let outbox_before = h.store.outbox_depth().await.unwrap();

    assert!(h.state.lifecycle.cancel(broadcast.id).await.unwrap());
    let after = h.store.broadcast(broadcast.id).await.unwrap().unwrap();
    assert_eq!(after.status, BroadcastStatus::Cancelled);
    assert_eq!(
        h.store.delivery(broadcast.id, "u1").await.unwrap().delivery_status,
        DeliveryStatus::Superseded
    );
    assert_eq!(
        h.store.delivery(broadcast.id, "u0").await.unwrap().delivery_status,
        DeliveryStatus::Delivered
    );
    // One removal event per targeted user.
    assert_eq!(h.store.outbox_depth().await.unwrap(), outbox_before + 2);

    // Cancelling again reports the terminal conflict.
    assert!(!h.state.lifecycle.cancel(broadcast.id).await.unwrap());
}

#[tokio::test]
async fn expiration_tick_expires_due_broadcasts() {
    let h = harness().await;
    let mut new = new_broadcast(TargetSpec::All);
    new.expires_at = Some(Utc::now() + chrono::Duration::seconds(2));
    let broadcast = h.state.lifecycle.create(new).await.unwrap();
    assert_eq!(broadcast.status, BroadcastStatus::Active);

    h.state
        .lifecycle
        .expire_due(Utc::now() + chrono::Duration::seconds(3))
        .await
        .unwrap();
    assert_eq!(
        h.store.broadcast(broadcast.id).await.unwrap().unwrap().status,
        BroadcastStatus::Expired
    );
}

#[tokio::test]
async fn creation_validation() {
    let h = harness().await;

    let mut empty_content = new_broadcast(TargetSpec::All);
    empty_content.content = "  ".to_owned();
    assert!(matches!(
        h.state.lifecycle.create(empty_content).await.unwrap_err(),
        CoreError::Validation(_)
    ));

    let mut expired = new_broadcast(TargetSpec::All);
    expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
    assert!(matches!(
        h.state.lifecycle.create(expired).await.unwrap_err(),
        CoreError::Validation(_)
    ));

    let empty_selected = new_broadcast(TargetSpec::Selected {
        user_ids: vec![" ".to_owned()],
    });
    assert!(matches!(
        h.state.lifecycle.create(empty_selected).await.unwrap_err(),
        CoreError::Validation(_)
    ));
}

#[tokio::test]
async fn failed_targeting_parks_the_broadcast_in_failed() {
    // A directory that refuses the lookup with a non-retryable error.
    struct BrokenDirectory;
    #[async_trait::async_trait]
    impl beacon_core::directory::UserDirectory for BrokenDirectory {
        async fn all_user_ids(&self) -> beacon_core::CoreResult<Vec<String>> {
            Err(CoreError::Validation("inconsistent target spec".to_owned()))
        }
        async fn users_with_role(&self, _role: &str) -> beacon_core::CoreResult<Vec<String>> {
            Err(CoreError::Validation("inconsistent target spec".to_owned()))
        }
        async fn product_subscribers(
            &self,
            _product: &str,
        ) -> beacon_core::CoreResult<Vec<String>> {
            Err(CoreError::Validation("inconsistent target spec".to_owned()))
        }
    }

    let store = Arc::new(MemoryStore::new());
    let log = Arc::new(MemoryLog::new());
    let grid = Arc::new(MemoryGrid::new());
    let settings = Arc::new(Settings::from_lookup(|_| None).unwrap());
    let state = AppState::new(
        store.clone(),
        log,
        grid,
        Arc::new(BrokenDirectory),
        settings,
    );

    let broadcast = state
        .lifecycle
        .create(new_broadcast(TargetSpec::Product {
            product: "alpha".to_owned(),
        }))
        .await
        .unwrap();
    assert!(state.lifecycle.precompute(&broadcast).await.is_err());
    assert_eq!(
        store.broadcast(broadcast.id).await.unwrap().unwrap().status,
        BroadcastStatus::Failed
    );
}
