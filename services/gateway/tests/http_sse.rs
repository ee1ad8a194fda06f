//! Gateway HTTP contract: SSE connect/disconnect, catch-up on reconnect,
//! the connection cap, and the stats endpoints.

use std::sync::Arc;
use std::time::Duration;

use beacon_core::config::Settings;
use beacon_core::directory::StaticDirectory;
use beacon_core::grid::memory::MemoryGrid;
use beacon_core::log::memory::MemoryLog;
use beacon_core::store::memory::MemoryStore;
use beacon_core::store::{BroadcastStore, NewBroadcast};
use beacon_protocol::{BroadcastStatus, Priority, TargetSpec};
use uuid::Uuid;

struct Server {
    base: String,
    state: gateway::AppState,
    store: Arc<MemoryStore>,
    _shutdown: tokio::sync::watch::Sender<bool>,
}

async fn serve() -> Server {
    let store = Arc::new(MemoryStore::new());
    let grid = Arc::new(MemoryGrid::new());
    let log = Arc::new(MemoryLog::new());
    let directory = Arc::new(StaticDirectory::new());
    let settings = Arc::new(
        Settings::from_lookup(|key| match key {
            "SSE_MAX_CONNECTIONS_PER_USER" => Some("2".to_owned()),
            _ => None,
        })
        .unwrap(),
    );
    let state = gateway::AppState::new(store.clone(), grid, log, directory, settings);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    gateway::spawn_pipeline(&state, shutdown_rx);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router_state = state.clone();
    tokio::spawn(async move {
        axum::serve(listener, gateway::build_router(router_state))
            .await
            .unwrap();
    });
    Server {
        base: format!("http://{addr}"),
        state,
        store,
        _shutdown: shutdown_tx,
    }
}

/// Read SSE chunks until `needle` shows up (or the deadline passes);
/// returns everything collected.
async fn read_until(response: &mut reqwest::Response, needle: &str, secs: u64) -> String {
    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(1), response.chunk()).await {
            Ok(Ok(Some(chunk))) => {
                collected.push_str(&String::from_utf8_lossy(&chunk));
                if collected.contains(needle) {
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(e)) => panic!("error reading SSE chunk: {e:?}"),
            Err(_) => {}
        }
    }
    collected
}

#[tokio::test]
async fn connect_emits_connected_frame_with_minted_connection_id() {
    let server = serve().await;
    let mut response = reqwest::Client::new()
        .get(format!("{}/api/user/sse/connect?userId=u1", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let collected = read_until(&mut response, "event: CONNECTED", 5).await;
    assert!(
        collected.contains("event: CONNECTED"),
        "expected CONNECTED frame, got:\n{collected}"
    );
    assert!(collected.contains("\"connectionId\""));

    // The registry now reports the user online.
    let connected: serde_json::Value = reqwest::Client::new()
        .get(format!("{}/api/user/sse/connected/u1", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(connected["online"], true);
    assert_eq!(connected["connections"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn excess_connection_gets_limit_frame_and_no_registry_slot() {
    let server = serve().await;
    let client = reqwest::Client::new();

    let _first = client
        .get(format!(
            "{}/api/user/sse/connect?userId=u1&connectionId=c1",
            server.base
        ))
        .send()
        .await
        .unwrap();
    let _second = client
        .get(format!(
            "{}/api/user/sse/connect?userId=u1&connectionId=c2",
            server.base
        ))
        .send()
        .await
        .unwrap();
    // Give the registrations a moment to land.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut third = client
        .get(format!(
            "{}/api/user/sse/connect?userId=u1&connectionId=c3",
            server.base
        ))
        .send()
        .await
        .unwrap();
    let collected = read_until(&mut third, "CONNECTION_LIMIT_REACHED", 5).await;
    assert!(
        collected.contains("event: CONNECTION_LIMIT_REACHED"),
        "expected limit frame, got:\n{collected}"
    );

    // No third slot leaked.
    let connections = server.state.registry.connections_of("u1").await.unwrap();
    assert_eq!(connections.len(), 2);
    assert!(!connections.contains(&"c3".to_owned()));
}

#[tokio::test]
async fn reconnect_catches_up_on_messages_missed_while_offline() {
    let server = serve().await;

    // A broadcast went ACTIVE while u7 was offline; the consumer had
    // written the durable row.
    let broadcast = server
        .store
        .insert_broadcast(
            NewBroadcast {
                id: Uuid::new_v4(),
                sender: "ops".to_owned(),
                content: "while you were away".to_owned(),
                priority: Priority::Normal,
                category: None,
                target: TargetSpec::Selected {
                    user_ids: vec!["u7".to_owned()],
                },
                scheduled_at: None,
                expires_at: None,
                fire_and_forget: false,
            },
            BroadcastStatus::Active,
            &[],
        )
        .await
        .unwrap();
    server
        .store
        .insert_delivery_batch(broadcast.id, &["u7".to_owned()])
        .await
        .unwrap();

    let mut response = reqwest::Client::new()
        .get(format!("{}/api/user/sse/connect?userId=u7", server.base))
        .send()
        .await
        .unwrap();
    let collected = read_until(&mut response, "while you were away", 5).await;
    assert!(
        collected.contains("event: MESSAGE"),
        "expected catch-up MESSAGE frame, got:\n{collected}"
    );

    // Catch-up marks the row delivered just after queueing the frame.
    let mut delivered = false;
    for _ in 0..50 {
        let row = server.store.delivery(broadcast.id, "u7").await.unwrap();
        if row.delivery_status == beacon_protocol::DeliveryStatus::Delivered {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(delivered, "catch-up must mark the row delivered");
}

#[tokio::test]
async fn disconnect_unregisters_the_connection() {
    let server = serve().await;
    let client = reqwest::Client::new();

    let _stream = client
        .get(format!(
            "{}/api/user/sse/connect?userId=u1&connectionId=c1",
            server.base
        ))
        .send()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.state.registry.is_online("u1").await.unwrap());

    let response = client
        .post(format!(
            "{}/api/user/sse/disconnect?userId=u1&connectionId=c1",
            server.base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    assert!(!server.state.registry.is_online("u1").await.unwrap());
}

#[tokio::test]
async fn stats_reports_pod_and_stream_counts() {
    let server = serve().await;
    let client = reqwest::Client::new();
    let _stream = client
        .get(format!(
            "{}/api/user/sse/connect?userId=u1&connectionId=c1",
            server.base
        ))
        .send()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats: serde_json::Value = client
        .get(format!("{}/api/user/sse/stats", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["clusterName"], "local");
    assert_eq!(stats["openConnections"], 1);
    assert_eq!(stats["localStreams"], 1);
}
