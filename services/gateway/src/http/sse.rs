//! User event-stream endpoints.
//!
//! `connect` opens the SSE stream: register the connection (cap-enforced),
//! emit `CONNECTED`, replay what the user missed while offline, then feed
//! live frames from the stream registry.  A capped connect still gets a
//! stream — one `CONNECTION_LIMIT_REACHED` frame, then close.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    Json,
};
use beacon_core::grid::GridCache;
use beacon_core::registry::RegisterOutcome;
use beacon_core::store::BroadcastStore;
use beacon_protocol::{DeliveryEventType, StreamFrame};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::http::response::{bad_request, core_error, rate_limited};
use crate::state::AppState;

fn frame_to_event(frame: &StreamFrame) -> Event {
    let payload = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_owned());
    Event::default().event(frame.event_name()).data(payload)
}

/// Unregisters the connection when the client goes away; the SSE stream
/// owns one and drops it on disconnect.
struct StreamGuard {
    state: AppState,
    user_id: String,
    connection_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let state = self.state.clone();
        let user_id = std::mem::take(&mut self.user_id);
        let connection_id = std::mem::take(&mut self.connection_id);
        tokio::spawn(async move {
            state.streams.detach(&user_id, &connection_id).await;
            if let Err(e) = state.registry.unregister(&user_id, &connection_id).await {
                warn!(
                    user_id = %user_id,
                    connection_id = %connection_id,
                    error = %e,
                    "unregister on stream close failed"
                );
            }
            info!(user_id = %user_id, connection_id = %connection_id, "stream closed");
        });
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "connectionId")]
    pub connection_id: Option<String>,
}

pub async fn connect(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> Response {
    let user_id = query.user_id.trim().to_owned();
    if user_id.is_empty() {
        return bad_request("userId is required");
    }
    if !state.limiter.allow(&format!("connect:{user_id}")).await {
        return rate_limited("too many stream connects for this user");
    }
    // Reconnecting clients bring their previous connection id; first-time
    // connects get a minted one back in the CONNECTED frame.
    let connection_id = query
        .connection_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    match state
        .registry
        .register(&user_id, &connection_id, Utc::now())
        .await
    {
        Ok(RegisterOutcome::Registered) => {}
        Ok(RegisterOutcome::LimitReached) => {
            let frame = StreamFrame::ConnectionLimitReached {
                max_connections: state.registry.max_per_user(),
            };
            let stream = stream::iter(vec![Ok::<Event, Infallible>(frame_to_event(&frame))]);
            return Sse::new(stream).into_response();
        }
        Err(e) => return core_error(&e),
    }

    let rx = state.streams.attach(&user_id, &connection_id).await;

    {
        let state = state.clone();
        let user_id = user_id.clone();
        let connection_id = connection_id.clone();
        tokio::spawn(async move {
            catch_up(state, user_id, connection_id).await;
        });
    }

    let connected = StreamFrame::Connected {
        connection_id: connection_id.clone(),
        user_id: user_id.clone(),
        pod_id: state.settings.pod_id.clone(),
    };
    let guard = StreamGuard {
        state,
        user_id,
        connection_id,
    };
    let frames = stream::iter(vec![connected]).chain(ReceiverStream::new(rx));
    let events = frames.map(move |frame| {
        let _held = &guard;
        Ok::<Event, Infallible>(frame_to_event(&frame))
    });
    Sse::new(events).into_response()
}

/// Replay for a (re)connecting user: pending events queued while offline
/// plus undelivered durable rows, deduplicated, delivered to the new
/// stream and marked delivered.
async fn catch_up(state: AppState, user_id: String, connection_id: String) {
    let mut broadcast_ids = Vec::new();

    match state.grid.drain_pending(&user_id, Utc::now()).await {
        Ok(events) => {
            for event in events {
                if event.event_type == DeliveryEventType::Created {
                    broadcast_ids.push(event.broadcast_id);
                }
            }
        }
        Err(e) => warn!(user_id = %user_id, error = %e, "pending-event drain failed"),
    }
    match state.store.undelivered_for_user(&user_id).await {
        Ok(broadcasts) => broadcast_ids.extend(broadcasts.into_iter().map(|b| b.id)),
        Err(e) => warn!(user_id = %user_id, error = %e, "undelivered lookup failed"),
    }
    let mut seen = std::collections::HashSet::new();
    broadcast_ids.retain(|id| seen.insert(*id));

    for broadcast_id in broadcast_ids {
        let broadcast = match state.grid.cached_broadcast(broadcast_id).await {
            Ok(Some(b)) => b,
            _ => match state.store.broadcast(broadcast_id).await {
                Ok(Some(b)) => b,
                _ => continue,
            },
        };
        let delivered = state
            .streams
            .send_to_connection(
                &user_id,
                &connection_id,
                StreamFrame::Message {
                    broadcast: broadcast.clone(),
                },
            )
            .await;
        if delivered && !broadcast.fire_and_forget {
            if let Err(e) = state.store.mark_delivered(broadcast_id, &user_id).await {
                warn!(
                    user_id = %user_id,
                    broadcast_id = %broadcast_id,
                    error = %e,
                    "catch-up mark failed"
                );
            }
        }
    }
    debug!(user_id = %user_id, connection_id = %connection_id, "catch-up complete");
}

#[derive(Debug, Deserialize)]
pub struct DisconnectQuery {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
}

pub async fn disconnect(
    State(state): State<AppState>,
    Query(query): Query<DisconnectQuery>,
) -> Response {
    state
        .streams
        .detach(&query.user_id, &query.connection_id)
        .await;
    match state
        .registry
        .unregister(&query.user_id, &query.connection_id)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => core_error(&e),
    }
}

pub async fn stats(State(state): State<AppState>) -> Response {
    let (local_users, local_streams) = state.streams.counts().await;
    let (online_users, open_connections) = match state.grid.connection_counts().await {
        Ok(counts) => counts,
        Err(e) => return core_error(&e),
    };
    Json(serde_json::json!({
        "podId": state.settings.pod_id,
        "clusterName": state.settings.cluster_name,
        "localUsers": local_users,
        "localStreams": local_streams,
        "onlineUsers": online_users,
        "openConnections": open_connections,
        "framesSent": state.streams.frames_sent(),
        "heartbeatsSent": state.streams.heartbeats_sent(),
    }))
    .into_response()
}

pub async fn connected(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    match state.registry.connections_of(&user_id).await {
        Ok(connections) => Json(serde_json::json!({
            "userId": user_id,
            "online": !connections.is_empty(),
            "connections": connections,
        }))
        .into_response(),
        Err(e) => core_error(&e),
    }
}
