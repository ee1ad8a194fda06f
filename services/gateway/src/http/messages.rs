//! User message endpoints: inbox reads and read receipts.
//!
//! Read receipts go through the outbox like every other event: the row flip,
//! the counter and the `READ` event commit together, and the orchestrator
//! mirrors the receipt to the user's other open streams.

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use beacon_core::store::{BroadcastStore, OutboxInsert};
use beacon_protocol::{DeliveryEventType, MessageDeliveryEvent};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::http::response::{bad_request, core_error};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "broadcastId")]
    pub broadcast_id: Uuid,
}

pub async fn mark_read(
    State(state): State<AppState>,
    Query(query): Query<ReadQuery>,
) -> Response {
    if query.user_id.trim().is_empty() {
        return bad_request("userId is required");
    }
    let event = MessageDeliveryEvent {
        event_id: Uuid::new_v4(),
        broadcast_id: query.broadcast_id,
        user_id: Some(query.user_id.clone()),
        event_type: DeliveryEventType::Read,
        timestamp: Utc::now(),
        message: None,
        fire_and_forget: false,
        transient_failure: false,
    };
    let insert = OutboxInsert::from_event(&event, &state.settings.orchestration_topic);
    match state
        .store
        .mark_read(query.broadcast_id, &query.user_id, std::slice::from_ref(&insert))
        .await
    {
        Ok(updated) => Json(serde_json::json!({ "updated": updated })).into_response(),
        Err(e) => core_error(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReadAllQuery {
    #[serde(rename = "userId")]
    pub user_id: String,
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    Query(query): Query<ReadAllQuery>,
) -> Response {
    if query.user_id.trim().is_empty() {
        return bad_request("userId is required");
    }
    match state
        .store
        .mark_all_read(&query.user_id, &state.settings.orchestration_topic)
        .await
    {
        Ok(changed) => Json(serde_json::json!({ "updated": changed.len() })).into_response(),
        Err(e) => core_error(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "unreadOnly", default)]
    pub unread_only: bool,
    pub limit: Option<i64>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
) -> Response {
    if query.user_id.trim().is_empty() {
        return bad_request("userId is required");
    }
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    match state
        .store
        .user_messages(&query.user_id, query.unread_only, limit)
        .await
    {
        Ok(messages) => {
            let body: Vec<serde_json::Value> = messages
                .into_iter()
                .map(|m| {
                    serde_json::json!({
                        "broadcast": m.broadcast,
                        "deliveryStatus": m.delivery_status,
                        "readStatus": m.read_status,
                        "receivedAt": m.created_at,
                    })
                })
                .collect();
            Json(serde_json::json!({ "messages": body })).into_response()
        }
        Err(e) => core_error(&e),
    }
}
