// beacon-protocol: broadcast delivery wire types and serialization.
//
// Everything that crosses a process boundary lives here: target specs and
// lifecycle statuses (admin API + durable rows), the delivery events carried
// on the orchestration topic, and the named frames pushed over user event
// streams.  All JSON field names are camelCase; discriminators are the
// frozen SCREAMING_SNAKE values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Target specification
// ---------------------------------------------------------------------------

/// Tagged audience description for a broadcast.
///
/// The fan-out strategy is a property of the variant: `Product` audiences can
/// be arbitrarily large and are precomputed into per-user rows before
/// activation (fan-out on write); every other variant is resolved by the
/// consumer at delivery time (fan-out on read).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TargetSpec {
    #[serde(rename = "ALL")]
    All,
    #[serde(rename = "ROLE")]
    Role { role: String },
    #[serde(rename = "PRODUCT")]
    Product { product: String },
    #[serde(rename = "SELECTED")]
    Selected {
        #[serde(rename = "userIds")]
        user_ids: Vec<String>,
    },
}

impl TargetSpec {
    /// True when the audience is precomputed into durable rows before
    /// activation rather than resolved at consume time.
    pub fn fan_out_on_write(&self) -> bool {
        matches!(self, TargetSpec::Product { .. })
    }
}

// ---------------------------------------------------------------------------
// Lifecycle statuses
// ---------------------------------------------------------------------------

/// Broadcast lifecycle status.
///
/// `Expired`, `Cancelled` and `Failed` are terminal; transitions between the
/// rest follow the lifecycle state machine and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastStatus {
    Preparing,
    Ready,
    Scheduled,
    Active,
    Expired,
    Cancelled,
    Failed,
}

impl BroadcastStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BroadcastStatus::Expired | BroadcastStatus::Cancelled | BroadcastStatus::Failed
        )
    }

    /// Frozen wire/database string for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            BroadcastStatus::Preparing => "PREPARING",
            BroadcastStatus::Ready => "READY",
            BroadcastStatus::Scheduled => "SCHEDULED",
            BroadcastStatus::Active => "ACTIVE",
            BroadcastStatus::Expired => "EXPIRED",
            BroadcastStatus::Cancelled => "CANCELLED",
            BroadcastStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Per-user delivery progress.  Monotonic except `Pending → Superseded`
/// on cancel/expire; a DLT redrive is the only sanctioned reset to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Superseded,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::Superseded => "SUPERSEDED",
        }
    }
}

/// Strictly monotonic: `Unread → Read`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadStatus {
    Unread,
    Read,
}

impl ReadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadStatus::Unread => "UNREAD",
            ReadStatus::Read => "READ",
        }
    }
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

/// An administrator-authored message plus its audience and schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Broadcast {
    pub id: Uuid,
    pub sender: String,
    pub content: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub target: TargetSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fire_and_forget: bool,
    pub status: BroadcastStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Delivery events (orchestration topic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryEventType {
    Created,
    Read,
    Cancelled,
    Expired,
    Failed,
}

/// One record on the orchestration topic.
///
/// `user_id` is absent on group events (fan-out on read): the consumer
/// resolves the audience from the broadcast's target spec at consume time.
/// Per-user events always carry the user and are keyed by it, which gives
/// per-user ordering on the partitioned log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeliveryEvent {
    pub event_id: Uuid,
    pub broadcast_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub event_type: DeliveryEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub fire_and_forget: bool,
    /// Marks a failure the consumer may retry (as opposed to a poison record).
    #[serde(default)]
    pub transient_failure: bool,
}

impl MessageDeliveryEvent {
    /// Routing key for the partitioned log: the user for per-user events,
    /// the broadcast for group events.  Keying by user is what yields the
    /// per-user ordering guarantee end to end.
    pub fn routing_key(&self) -> String {
        match &self.user_id {
            Some(user) if !user.is_empty() => user.clone(),
            _ => self.broadcast_id.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// User event-stream frames
// ---------------------------------------------------------------------------

/// Why a message was removed from a user's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemovalReason {
    Cancelled,
    Expired,
}

/// A named frame on a user's event stream.
///
/// The frame name (SSE `event:` field) comes from [`StreamFrame::event_name`];
/// the payload is the JSON body of the variant.  `Heartbeat` frames are
/// ignored by the application layer on the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamFrame {
    /// Sent exactly once after the stream opens; carries the connection id
    /// the server assigned (or echoed back).
    #[serde(rename_all = "camelCase")]
    Connected {
        connection_id: String,
        user_id: String,
        pod_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Message { broadcast: Broadcast },
    #[serde(rename_all = "camelCase")]
    ReadReceipt {
        broadcast_id: Uuid,
        user_id: String,
        read_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    MessageRemoved {
        broadcast_id: Uuid,
        reason: RemovalReason,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat { epoch: i64 },
    #[serde(rename_all = "camelCase")]
    ConnectionLimitReached { max_connections: u32 },
    ServerShutdown,
}

impl StreamFrame {
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamFrame::Connected { .. } => "CONNECTED",
            StreamFrame::Message { .. } => "MESSAGE",
            StreamFrame::ReadReceipt { .. } => "READ_RECEIPT",
            StreamFrame::MessageRemoved { .. } => "MESSAGE_REMOVED",
            StreamFrame::Heartbeat { .. } => "HEARTBEAT",
            StreamFrame::ConnectionLimitReached { .. } => "CONNECTION_LIMIT_REACHED",
            StreamFrame::ServerShutdown => "SERVER_SHUTDOWN",
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP error envelope
// ---------------------------------------------------------------------------

/// Frozen error codes returned in [`HttpErrorEnvelope::code`].
pub mod error_codes {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const CONFLICT: &str = "CONFLICT";
    pub const STORE_UNAVAILABLE: &str = "STORE_UNAVAILABLE";
    pub const LOG_UNAVAILABLE: &str = "LOG_UNAVAILABLE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Machine-readable error body for every non-2xx admin/user response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    /// One of the frozen error codes.
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_spec_discriminators_are_frozen() {
        let all = serde_json::to_value(&TargetSpec::All).unwrap();
        assert_eq!(all, serde_json::json!({ "type": "ALL" }));

        let selected = serde_json::to_value(&TargetSpec::Selected {
            user_ids: vec!["u1".to_owned(), "u2".to_owned()],
        })
        .unwrap();
        assert_eq!(
            selected,
            serde_json::json!({ "type": "SELECTED", "userIds": ["u1", "u2"] })
        );
    }

    #[test]
    fn fan_out_mode_is_a_property_of_the_variant() {
        assert!(TargetSpec::Product {
            product: "p".to_owned()
        }
        .fan_out_on_write());
        assert!(!TargetSpec::All.fan_out_on_write());
        assert!(!TargetSpec::Role {
            role: "r".to_owned()
        }
        .fan_out_on_write());
        assert!(!TargetSpec::Selected { user_ids: vec![] }.fan_out_on_write());
    }

    #[test]
    fn group_events_route_by_broadcast_id() {
        let broadcast_id = Uuid::new_v4();
        let mut event = MessageDeliveryEvent {
            event_id: Uuid::new_v4(),
            broadcast_id,
            user_id: None,
            event_type: DeliveryEventType::Created,
            timestamp: Utc::now(),
            message: None,
            fire_and_forget: false,
            transient_failure: false,
        };
        assert_eq!(event.routing_key(), broadcast_id.to_string());

        event.user_id = Some("user-7".to_owned());
        assert_eq!(event.routing_key(), "user-7");
    }

    #[test]
    fn terminal_statuses() {
        for status in [
            BroadcastStatus::Expired,
            BroadcastStatus::Cancelled,
            BroadcastStatus::Failed,
        ] {
            assert!(status.is_terminal());
        }
        for status in [
            BroadcastStatus::Preparing,
            BroadcastStatus::Ready,
            BroadcastStatus::Scheduled,
            BroadcastStatus::Active,
        ] {
            assert!(!status.is_terminal());
        }
    }
}
