//! End-to-end delivery scenarios: admin lifecycle -> outbox -> log ->
//! orchestrator -> grid -> worker -> streams, all over the in-memory
//! backends shared by both services.

use std::sync::Arc;
use std::time::Duration;

use admin::outbox::OutboxPoller;
use beacon_core::config::Settings;
use beacon_core::directory::StaticDirectory;
use beacon_core::grid::memory::MemoryGrid;
use beacon_core::grid::GridCache;
use beacon_core::log::memory::MemoryLog;
use beacon_core::log::EventLog;
use beacon_core::registry::RegisterOutcome;
use beacon_core::store::memory::MemoryStore;
use beacon_core::store::{BroadcastStore, NewBroadcast, OutboxInsert};
use beacon_protocol::{
    BroadcastStatus, DeliveryEventType, DeliveryStatus, MessageDeliveryEvent, Priority,
    StreamFrame, TargetSpec,
};
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

struct Pipeline {
    admin: admin::AppState,
    gateway: gateway::AppState,
    store: Arc<MemoryStore>,
    grid: Arc<MemoryGrid>,
    log: Arc<MemoryLog>,
    poller: OutboxPoller,
    _shutdown: watch::Sender<bool>,
}

async fn pipeline() -> Pipeline {
    let store = Arc::new(MemoryStore::new());
    let grid = Arc::new(MemoryGrid::new());
    let log = Arc::new(MemoryLog::new());
    let directory = Arc::new(StaticDirectory::new());
    for user in ["u1", "u2", "u3"] {
        directory.upsert_user(user, &["member"], &["alpha"]).await;
    }

    let settings = Arc::new(
        Settings::from_lookup(|key| match key {
            "LOG_RETRY_MAX_ATTEMPTS" => Some("2".to_owned()),
            "LOG_RETRY_BACKOFF_MS" => Some("10".to_owned()),
            _ => None,
        })
        .unwrap(),
    );

    let gateway_state = gateway::AppState::new(
        store.clone(),
        grid.clone(),
        log.clone(),
        directory.clone(),
        settings.clone(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    gateway::spawn_pipeline(&gateway_state, shutdown_rx);

    let admin_state = admin::AppState::new(
        store.clone(),
        log.clone(),
        grid.clone(),
        directory,
        settings.clone(),
    );
    let poller = OutboxPoller::new(
        store.clone(),
        log.clone(),
        settings.outbox_batch_size,
        settings.publish_timeout,
    );

    // Let the worker and orchestrator subscribe before anything flows.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Pipeline {
        admin: admin_state,
        gateway: gateway_state,
        store,
        grid,
        log,
        poller,
        _shutdown: shutdown_tx,
    }
}

async fn connect(p: &Pipeline, user: &str, connection: &str) -> mpsc::Receiver<StreamFrame> {
    let outcome = p
        .gateway
        .registry
        .register(user, connection, Utc::now())
        .await
        .unwrap();
    assert_eq!(outcome, RegisterOutcome::Registered);
    p.gateway.streams.attach(user, connection).await
}

async fn next_frame(rx: &mut mpsc::Receiver<StreamFrame>, millis: u64) -> Option<StreamFrame> {
    tokio::time::timeout(Duration::from_millis(millis), rx.recv())
        .await
        .ok()
        .flatten()
}

async fn eventually<F, Fut>(millis: u64, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(millis);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn selected(users: &[&str]) -> NewBroadcast {
    NewBroadcast {
        id: Uuid::new_v4(),
        sender: "ops".to_owned(),
        content: "release 2.4 is live".to_owned(),
        priority: Priority::Normal,
        category: None,
        target: TargetSpec::Selected {
            user_ids: users.iter().map(|u| (*u).to_owned()).collect(),
        },
        scheduled_at: None,
        expires_at: None,
        fire_and_forget: false,
    }
}

#[tokio::test]
async fn immediate_selected_broadcast_reaches_both_online_users() {
    let p = pipeline().await;
    let mut rx1 = connect(&p, "u1", "c1").await;
    let mut rx2 = connect(&p, "u2", "c2").await;

    let broadcast = p.admin.lifecycle.create(selected(&["u1", "u2"])).await.unwrap();
    assert_eq!(broadcast.status, BroadcastStatus::Active);
    p.poller.tick().await.unwrap();

    for rx in [&mut rx1, &mut rx2] {
        match next_frame(rx, 1000).await {
            Some(StreamFrame::Message { broadcast: b }) => {
                assert_eq!(b.id, broadcast.id);
                assert_eq!(b.content, "release 2.4 is live");
            }
            other => panic!("expected MESSAGE frame, got {other:?}"),
        }
    }

    let store = p.store.clone();
    let id = broadcast.id;
    assert!(
        eventually(1000, || {
            let store = store.clone();
            async move {
                let stats = store.stats(id).await.unwrap();
                stats.total_delivered == 2
            }
        })
        .await,
        "both rows must reach DELIVERED"
    );
    for user in ["u1", "u2"] {
        let row = p.store.delivery(broadcast.id, user).await.unwrap();
        assert_eq!(row.delivery_status, DeliveryStatus::Delivered);
    }
}

#[tokio::test]
async fn cancellation_pushes_message_removed_to_open_streams() {
    let p = pipeline().await;
    let mut rx1 = connect(&p, "u1", "c1").await;
    let mut rx2 = connect(&p, "u2", "c2").await;

    let broadcast = p.admin.lifecycle.create(selected(&["u1", "u2"])).await.unwrap();
    p.poller.tick().await.unwrap();
    assert!(matches!(
        next_frame(&mut rx1, 1000).await,
        Some(StreamFrame::Message { .. })
    ));
    assert!(matches!(
        next_frame(&mut rx2, 1000).await,
        Some(StreamFrame::Message { .. })
    ));

    assert!(p.admin.lifecycle.cancel(broadcast.id).await.unwrap());
    p.poller.tick().await.unwrap();

    for rx in [&mut rx1, &mut rx2] {
        match next_frame(rx, 1000).await {
            Some(StreamFrame::MessageRemoved { broadcast_id, .. }) => {
                assert_eq!(broadcast_id, broadcast.id);
            }
            other => panic!("expected MESSAGE_REMOVED frame, got {other:?}"),
        }
    }
    assert_eq!(
        p.store.broadcast(broadcast.id).await.unwrap().unwrap().status,
        BroadcastStatus::Cancelled
    );
    // Delivered rows stay delivered; nothing regressed to PENDING.
    for user in ["u1", "u2"] {
        let row = p.store.delivery(broadcast.id, user).await.unwrap();
        assert_eq!(row.delivery_status, DeliveryStatus::Delivered);
    }
}

#[tokio::test]
async fn scheduled_all_broadcast_activates_and_reaches_online_users() {
    let p = pipeline().await;
    let mut rx1 = connect(&p, "u1", "c1").await;
    let mut rx2 = connect(&p, "u2", "c2").await;
    // u3 stays offline.

    let mut new = selected(&["ignored"]);
    new.target = TargetSpec::All;
    new.scheduled_at = Some(Utc::now() + chrono::Duration::seconds(2));
    let broadcast = p.admin.lifecycle.create(new).await.unwrap();
    assert_eq!(broadcast.status, BroadcastStatus::Scheduled);

    // Activation tick past the due time emits the single group event.
    p.admin
        .lifecycle
        .activate_due(Utc::now() + chrono::Duration::seconds(3))
        .await
        .unwrap();
    p.poller.tick().await.unwrap();

    for rx in [&mut rx1, &mut rx2] {
        assert!(matches!(
            next_frame(rx, 1000).await,
            Some(StreamFrame::Message { .. })
        ));
    }

    // The offline user has a pending event and an undelivered row waiting.
    let store = p.store.clone();
    let id = broadcast.id;
    assert!(
        eventually(1000, || {
            let store = store.clone();
            async move { store.delivery(id, "u3").await.is_some() }
        })
        .await,
        "offline user must get a durable row"
    );
    let row = p.store.delivery(broadcast.id, "u3").await.unwrap();
    assert_eq!(row.delivery_status, DeliveryStatus::Pending);
    // The pending-event enqueue trails the row insert by a beat.
    let mut queued = Vec::new();
    for _ in 0..50 {
        queued = p.grid.drain_pending("u3", Utc::now()).await.unwrap();
        if !queued.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(
        queued.iter().any(|e| e.broadcast_id == broadcast.id),
        "offline user must have a pending event"
    );
}

#[tokio::test]
async fn poison_record_lands_in_dlt_and_consumption_continues() {
    let p = pipeline().await;
    let mut rx1 = connect(&p, "u1", "c1").await;

    // Inject a record whose payload cannot deserialize.
    p.log
        .publish("broadcast-orchestration", "poison-key", b"{not json at all")
        .await
        .unwrap();

    // A healthy broadcast right behind it.
    let broadcast = p.admin.lifecycle.create(selected(&["u1"])).await.unwrap();
    p.poller.tick().await.unwrap();

    // The poison record is quarantined with its context...
    let store = p.store.clone();
    assert!(
        eventually(2000, || {
            let store = store.clone();
            async move {
                store
                    .list_dlt(10)
                    .await
                    .unwrap()
                    .iter()
                    .any(|r| r.key == "poison-key" && r.fail_title == "SerializationPoison")
            }
        })
        .await,
        "poison record must reach the DLT"
    );
    let record = p
        .store
        .list_dlt(10)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.key == "poison-key")
        .unwrap();
    assert_eq!(record.payload, b"{not json at all");
    assert_eq!(record.original_topic, "broadcast-orchestration");
    let log = p.log.clone();
    assert!(
        eventually(1000, || {
            let log = log.clone();
            async move { log.topic_len("broadcast-orchestration-dlt").await == 1 }
        })
        .await,
        "dead-letter sibling topic must carry the record"
    );

    // ...and the consumer keeps going.
    match next_frame(&mut rx1, 2000).await {
        Some(StreamFrame::Message { broadcast: b }) => assert_eq!(b.id, broadcast.id),
        other => panic!("expected MESSAGE after poison record, got {other:?}"),
    }
}

#[tokio::test]
async fn offline_user_catches_up_through_pending_and_durable_rows() {
    let p = pipeline().await;

    // u1 is offline when the broadcast activates.
    let broadcast = p.admin.lifecycle.create(selected(&["u1"])).await.unwrap();
    p.poller.tick().await.unwrap();

    let store = p.store.clone();
    let id = broadcast.id;
    assert!(
        eventually(1000, || {
            let store = store.clone();
            async move { store.delivery(id, "u1").await.is_some() }
        })
        .await,
        "consumer must write the durable row"
    );
    assert_eq!(
        p.store.delivery(broadcast.id, "u1").await.unwrap().delivery_status,
        DeliveryStatus::Pending
    );

    // Reconnect: the catch-up set is exactly this broadcast.
    let pending = p.grid.drain_pending("u1", Utc::now()).await.unwrap();
    let undelivered = p.store.undelivered_for_user("u1").await.unwrap();
    let via_pending = pending
        .iter()
        .any(|e| e.broadcast_id == broadcast.id && e.event_type == DeliveryEventType::Created);
    let via_rows = undelivered.iter().any(|b| b.id == broadcast.id);
    assert!(via_pending || via_rows, "catch-up must surface the broadcast");
}

#[tokio::test]
async fn read_receipt_flows_back_to_every_open_stream() {
    let p = pipeline().await;
    let mut rx1 = connect(&p, "u1", "c1").await;
    let mut rx2 = connect(&p, "u1", "c2").await;

    let broadcast = p.admin.lifecycle.create(selected(&["u1"])).await.unwrap();
    p.poller.tick().await.unwrap();
    // Both streams of the user get the message.
    assert!(matches!(
        next_frame(&mut rx1, 1000).await,
        Some(StreamFrame::Message { .. })
    ));
    assert!(matches!(
        next_frame(&mut rx2, 1000).await,
        Some(StreamFrame::Message { .. })
    ));

    // The read receipt goes through the outbox like everything else.
    let event = MessageDeliveryEvent {
        event_id: Uuid::new_v4(),
        broadcast_id: broadcast.id,
        user_id: Some("u1".to_owned()),
        event_type: DeliveryEventType::Read,
        timestamp: Utc::now(),
        message: None,
        fire_and_forget: false,
        transient_failure: false,
    };
    let insert = OutboxInsert::from_event(&event, "broadcast-orchestration");
    assert!(p
        .store
        .mark_read(broadcast.id, "u1", std::slice::from_ref(&insert))
        .await
        .unwrap());
    p.poller.tick().await.unwrap();

    for rx in [&mut rx1, &mut rx2] {
        match next_frame(rx, 1000).await {
            Some(StreamFrame::ReadReceipt { broadcast_id, user_id, .. }) => {
                assert_eq!(broadcast_id, broadcast.id);
                assert_eq!(user_id, "u1");
            }
            other => panic!("expected READ_RECEIPT frame, got {other:?}"),
        }
    }
    assert_eq!(p.store.stats(broadcast.id).await.unwrap().total_read, 1);
}

#[tokio::test]
async fn per_user_frame_order_matches_outbox_insertion_order() {
    let p = pipeline().await;
    let mut rx = connect(&p, "u1", "c1").await;

    // Write-fanout broadcasts emit per-user events keyed by the user, so
    // all five land on u1's partition in activation order.
    for i in 0..5 {
        let mut new = selected(&["unused"]);
        new.target = TargetSpec::Product {
            product: "alpha".to_owned(),
        };
        new.content = format!("message {i}");
        let broadcast = p.admin.lifecycle.create(new).await.unwrap();
        p.admin.lifecycle.precompute(&broadcast).await.unwrap();
        p.admin.lifecycle.activate_due(Utc::now()).await.unwrap();
    }
    p.poller.tick().await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 5 {
        match next_frame(&mut rx, 2000).await {
            Some(StreamFrame::Message { broadcast }) => seen.push(broadcast.content.clone()),
            Some(_) => {}
            None => panic!("stream dried up after {} frames", seen.len()),
        }
    }
    assert_eq!(
        seen,
        (0..5).map(|i| format!("message {i}")).collect::<Vec<_>>(),
        "per-user order must match outbox insertion order"
    );
}
