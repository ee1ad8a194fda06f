//! Admin HTTP contract: broadcast CRUD and DLT endpoints over a live router.

use std::sync::Arc;

use beacon_core::config::Settings;
use beacon_core::directory::StaticDirectory;
use beacon_core::grid::memory::MemoryGrid;
use beacon_core::log::memory::MemoryLog;
use beacon_core::store::memory::MemoryStore;
use beacon_core::store::{BroadcastStore, DltRecord};
use chrono::Utc;
use uuid::Uuid;

async fn serve() -> (String, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let log = Arc::new(MemoryLog::new());
    let grid = Arc::new(MemoryGrid::new());
    let directory = Arc::new(StaticDirectory::new());
    directory.upsert_user("u1", &["member"], &[]).await;
    directory.upsert_user("u2", &["member"], &[]).await;
    let settings = Arc::new(Settings::from_lookup(|_| None).unwrap());
    let state = admin::AppState::new(store.clone(), log, grid, directory, settings);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, admin::build_router(state)).await.unwrap();
    });
    (format!("http://{addr}"), store)
}

#[tokio::test]
async fn broadcast_crud_round_trip() {
    let (base, _store) = serve().await;
    let client = reqwest::Client::new();

    // Create an immediate SELECTED broadcast.
    let created: serde_json::Value = client
        .post(format!("{base}/api/admin/broadcasts"))
        .json(&serde_json::json!({
            "sender": "ops",
            "content": "hello there",
            "target": { "type": "SELECTED", "userIds": ["u1", "u2"] },
            "priority": "HIGH",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["status"], "ACTIVE");
    assert_eq!(created["content"], "hello there");
    let id = created["id"].as_str().unwrap().to_owned();

    // It shows up in the active listing.
    let listed: serde_json::Value = client
        .get(format!("{base}/api/admin/broadcasts?filter=active"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let broadcasts = listed["broadcasts"].as_array().unwrap();
    assert!(broadcasts.iter().any(|b| b["id"] == created["id"]));

    // Stats exist with zeroed counters.
    let stats: serde_json::Value = client
        .get(format!("{base}/api/admin/broadcasts/{id}/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["totalTargeted"], 0);
    assert_eq!(stats["totalDelivered"], 0);

    // Delete cancels; a second delete conflicts.
    let deleted = client
        .delete(format!("{base}/api/admin/broadcasts/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);
    let again = client
        .delete(format!("{base}/api/admin/broadcasts/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 409);
}

#[tokio::test]
async fn validation_and_not_found_contracts() {
    let (base, _store) = serve().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/admin/broadcasts"))
        .json(&serde_json::json!({
            "sender": "ops",
            "content": "  ",
            "target": { "type": "ALL" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "BAD_REQUEST");

    let missing = client
        .get(format!("{base}/api/admin/broadcasts/{}", Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let bad_filter = client
        .get(format!("{base}/api/admin/broadcasts?filter=bogus"))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_filter.status(), 400);
}

#[tokio::test]
async fn all_user_ids_comes_from_the_directory() {
    let (base, _store) = serve().await;
    let body: serde_json::Value = reqwest::Client::new()
        .get(format!("{base}/api/admin/broadcasts/users/all-ids"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["userIds"], serde_json::json!(["u1", "u2"]));
}

#[tokio::test]
async fn dlt_endpoints_list_redrive_and_purge() {
    let (base, store) = serve().await;
    let client = reqwest::Client::new();

    let record_id = Uuid::new_v4();
    store
        .insert_dlt(DltRecord {
            id: record_id,
            original_topic: "broadcast-orchestration".to_owned(),
            partition: 1,
            offset: 42,
            key: "u1".to_owned(),
            fail_title: "ProcessingFailure".to_owned(),
            fail_detail: "grid write failed".to_owned(),
            payload: b"{}".to_vec(),
            failed_at: Utc::now(),
        })
        .await
        .unwrap();

    let listed: serde_json::Value = client
        .get(format!("{base}/api/admin/dlt/messages"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["messages"].as_array().unwrap().len(), 1);
    assert_eq!(listed["messages"][0]["failTitle"], "ProcessingFailure");

    let redriven: serde_json::Value = client
        .post(format!("{base}/api/admin/dlt/redrive/{record_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(redriven["redriven"], 1);

    // The record is gone now.
    let missing = client
        .post(format!("{base}/api/admin/dlt/redrive/{record_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let purged: serde_json::Value = client
        .delete(format!("{base}/api/admin/dlt/purge-all"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(purged["purged"], 0);
}
