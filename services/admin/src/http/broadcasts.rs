//! Admin broadcast endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use beacon_core::directory::UserDirectory;
use beacon_core::store::{BroadcastFilter, BroadcastStore, NewBroadcast};
use beacon_protocol::{DeliveryStatus, Priority, TargetSpec};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::http::response::{bad_request, conflict, core_error, not_found, rate_limited};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBroadcastRequest {
    pub sender: String,
    pub content: String,
    #[serde(default)]
    pub priority: Priority,
    pub category: Option<String>,
    pub target: TargetSpec,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fire_and_forget: bool,
}

pub async fn create_broadcast(
    State(state): State<AppState>,
    Json(body): Json<CreateBroadcastRequest>,
) -> Response {
    if !state.limiter.allow("create-broadcast").await {
        return rate_limited("broadcast creation limit reached, retry shortly");
    }

    let new = NewBroadcast {
        id: Uuid::new_v4(),
        sender: body.sender,
        content: body.content,
        priority: body.priority,
        category: body.category,
        target: body.target,
        scheduled_at: body.scheduled_at,
        expires_at: body.expires_at,
        fire_and_forget: body.fire_and_forget,
    };

    match state.lifecycle.create(new).await {
        Ok(broadcast) => {
            state.lifecycle.spawn_precompute(broadcast.clone());
            (StatusCode::CREATED, Json(broadcast)).into_response()
        }
        Err(e) => core_error(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub filter: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_broadcasts(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let filter = match query.filter.as_deref() {
        None | Some("all") => BroadcastFilter::All,
        Some("active") => BroadcastFilter::Active,
        Some("scheduled") => BroadcastFilter::Scheduled,
        Some(other) => {
            return bad_request(format!(
                "unknown filter '{other}', expected all|active|scheduled"
            ))
        }
    };
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    match state.store.list_broadcasts(filter, limit).await {
        Ok(broadcasts) => {
            Json(serde_json::json!({ "broadcasts": broadcasts })).into_response()
        }
        Err(e) => core_error(&e),
    }
}

pub async fn get_broadcast(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.store.broadcast(id).await {
        Ok(Some(broadcast)) => Json(broadcast).into_response(),
        Ok(None) => not_found("broadcast not found"),
        Err(e) => core_error(&e),
    }
}

pub async fn get_broadcast_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    let exists = match state.store.broadcast(id).await {
        Ok(Some(_)) => true,
        Ok(None) => false,
        Err(e) => return core_error(&e),
    };
    if !exists {
        return not_found("broadcast not found");
    }
    match state.store.stats(id).await {
        Ok(stats) => Json(serde_json::json!({
            "broadcastId": id,
            "totalTargeted": stats.total_targeted,
            "totalDelivered": stats.total_delivered,
            "totalRead": stats.total_read,
            "totalFailed": stats.total_failed,
        }))
        .into_response(),
        Err(e) => core_error(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct DeliveriesQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_deliveries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<DeliveriesQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        None => None,
        Some("PENDING") => Some(DeliveryStatus::Pending),
        Some("DELIVERED") => Some(DeliveryStatus::Delivered),
        Some("FAILED") => Some(DeliveryStatus::Failed),
        Some("SUPERSEDED") => Some(DeliveryStatus::Superseded),
        Some(other) => return bad_request(format!("unknown delivery status '{other}'")),
    };
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0).max(0);

    match state.store.deliveries(id, status, limit, offset).await {
        Ok(rows) => {
            let deliveries: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|row| {
                    serde_json::json!({
                        "broadcastId": row.broadcast_id,
                        "userId": row.user_id,
                        "deliveryStatus": row.delivery_status,
                        "readStatus": row.read_status,
                        "deliveredAt": row.delivered_at,
                        "readAt": row.read_at,
                        "createdAt": row.created_at,
                    })
                })
                .collect();
            Json(serde_json::json!({ "deliveries": deliveries })).into_response()
        }
        Err(e) => core_error(&e),
    }
}

/// DELETE cancels: pending rows are superseded and removal events fan out.
pub async fn delete_broadcast(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.lifecycle.cancel(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => conflict("broadcast is already terminal"),
        Err(e) => core_error(&e),
    }
}

pub async fn all_user_ids(State(state): State<AppState>) -> Response {
    match state.directory.all_user_ids().await {
        Ok(ids) => Json(serde_json::json!({ "userIds": ids })).into_response(),
        Err(e) => core_error(&e),
    }
}
