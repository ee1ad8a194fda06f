//! Dead-letter admin endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::http::response::{core_error, not_found};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DltQuery {
    pub limit: Option<i64>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<DltQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    match state.dlt.list(limit).await {
        Ok(records) => {
            let messages: Vec<serde_json::Value> = records
                .into_iter()
                .map(|record| {
                    serde_json::json!({
                        "id": record.id,
                        "originalTopic": record.original_topic,
                        "partition": record.partition,
                        "offset": record.offset,
                        "key": record.key,
                        "failTitle": record.fail_title,
                        "failDetail": record.fail_detail,
                        "payload": String::from_utf8_lossy(&record.payload),
                        "failedAt": record.failed_at,
                    })
                })
                .collect();
            Json(serde_json::json!({ "messages": messages })).into_response()
        }
        Err(e) => core_error(&e),
    }
}

pub async fn redrive_one(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.dlt.redrive(id).await {
        Ok(true) => Json(serde_json::json!({ "redriven": 1 })).into_response(),
        Ok(false) => not_found("dead-letter record not found"),
        Err(e) => core_error(&e),
    }
}

pub async fn redrive_all(State(state): State<AppState>) -> Response {
    match state.dlt.redrive_all().await {
        Ok(redriven) => Json(serde_json::json!({ "redriven": redriven })).into_response(),
        Err(e) => core_error(&e),
    }
}

pub async fn purge_one(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.dlt.purge(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found("dead-letter record not found"),
        Err(e) => core_error(&e),
    }
}

pub async fn purge_all(State(state): State<AppState>) -> Response {
    match state.dlt.purge_all().await {
        Ok(purged) => Json(serde_json::json!({ "purged": purged })).into_response(),
        Err(e) => core_error(&e),
    }
}
