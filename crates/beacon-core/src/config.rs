//! Process settings, resolved once at startup from environment variables.
//!
//! Every knob has a default so a bare process comes up usable; malformed
//! values are a fatal init error rather than a silent fallback.

use std::time::Duration;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct Settings {
    /// Identity of this process instance; defaults to a random suffix.
    pub pod_id: String,
    pub cluster_name: String,

    /// Idle timeout after which an open stream is torn down server-side.
    pub sse_timeout: Duration,
    /// Keepalive frame cadence on open streams.
    pub sse_heartbeat_interval: Duration,
    pub sse_max_connections_per_user: u32,
    /// A connection whose last heartbeat is older than this is stale.
    pub sse_client_timeout_threshold: Duration,

    /// Batch size for precompute row inserts.
    pub db_batch_size: usize,

    pub orchestration_topic: String,
    pub orchestration_group: String,
    /// Consumer retry budget before a record is dead-lettered.
    pub log_retry_max_attempts: u32,
    pub log_retry_backoff: Duration,
    /// Per-call bound on synchronous log publishes.
    pub publish_timeout: Duration,

    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub scheduler_interval: Duration,
    pub lease_ttl: Duration,

    /// How long an event waits in the pending queue for an offline user.
    pub pending_event_ttl: Duration,
    /// Bounded in-memory queue between dispatch and each stream sender.
    pub stream_queue_capacity: usize,
    /// A stream write blocking longer than this closes the stream.
    pub stream_write_budget: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            pod_id: format!("pod-{}", uuid::Uuid::new_v4().simple()),
            cluster_name: "local".to_owned(),
            sse_timeout: Duration::from_secs(3600),
            sse_heartbeat_interval: Duration::from_secs(30),
            sse_max_connections_per_user: 3,
            sse_client_timeout_threshold: Duration::from_secs(90),
            db_batch_size: 1000,
            orchestration_topic: "broadcast-orchestration".to_owned(),
            orchestration_group: "broadcast-orchestrator".to_owned(),
            log_retry_max_attempts: 3,
            log_retry_backoff: Duration::from_secs(1),
            publish_timeout: Duration::from_secs(5),
            outbox_poll_interval: Duration::from_secs(2),
            outbox_batch_size: 100,
            scheduler_interval: Duration::from_secs(60),
            lease_ttl: Duration::from_secs(30),
            pending_event_ttl: Duration::from_secs(24 * 3600),
            stream_queue_capacity: 64,
            stream_write_budget: Duration::from_secs(5),
        }
    }
}

impl Settings {
    /// Resolve settings from process environment variables.
    pub fn from_env() -> CoreResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve settings through an arbitrary lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CoreResult<Self> {
        let mut settings = Settings::default();

        if let Some(v) = lookup("POD_ID") {
            settings.pod_id = v;
        }
        if let Some(v) = lookup("CLUSTER_NAME") {
            settings.cluster_name = v;
        }
        if let Some(v) = lookup("ORCHESTRATION_TOPIC") {
            settings.orchestration_topic = v;
        }
        if let Some(v) = lookup("ORCHESTRATION_CONSUMER_GROUP") {
            settings.orchestration_group = v;
        }

        settings.sse_timeout = secs(&lookup, "SSE_TIMEOUT_SECS", settings.sse_timeout)?;
        settings.sse_heartbeat_interval = secs(
            &lookup,
            "SSE_HEARTBEAT_INTERVAL_SECS",
            settings.sse_heartbeat_interval,
        )?;
        settings.sse_client_timeout_threshold = secs(
            &lookup,
            "SSE_CLIENT_TIMEOUT_THRESHOLD_SECS",
            settings.sse_client_timeout_threshold,
        )?;
        settings.sse_max_connections_per_user = int(
            &lookup,
            "SSE_MAX_CONNECTIONS_PER_USER",
            settings.sse_max_connections_per_user,
        )?;
        settings.db_batch_size = int(&lookup, "DB_BATCH_SIZE", settings.db_batch_size)?;
        settings.log_retry_max_attempts = int(
            &lookup,
            "LOG_RETRY_MAX_ATTEMPTS",
            settings.log_retry_max_attempts,
        )?;
        settings.log_retry_backoff = millis(
            &lookup,
            "LOG_RETRY_BACKOFF_MS",
            settings.log_retry_backoff,
        )?;
        settings.publish_timeout = millis(
            &lookup,
            "LOG_PUBLISH_TIMEOUT_MS",
            settings.publish_timeout,
        )?;
        settings.outbox_poll_interval = millis(
            &lookup,
            "OUTBOX_POLL_INTERVAL_MS",
            settings.outbox_poll_interval,
        )?;
        settings.outbox_batch_size = int(&lookup, "OUTBOX_BATCH_SIZE", settings.outbox_batch_size)?;
        settings.scheduler_interval = secs(
            &lookup,
            "SCHEDULER_INTERVAL_SECS",
            settings.scheduler_interval,
        )?;
        settings.lease_ttl = secs(&lookup, "SCHEDULER_LEASE_TTL_SECS", settings.lease_ttl)?;
        settings.pending_event_ttl = secs(
            &lookup,
            "PENDING_EVENT_TTL_SECS",
            settings.pending_event_ttl,
        )?;

        if settings.sse_max_connections_per_user == 0 {
            return Err(CoreError::Fatal(
                "SSE_MAX_CONNECTIONS_PER_USER must be at least 1".to_owned(),
            ));
        }
        if settings.db_batch_size == 0 {
            return Err(CoreError::Fatal("DB_BATCH_SIZE must be at least 1".to_owned()));
        }

        Ok(settings)
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> CoreResult<Duration> {
    match lookup(key) {
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| CoreError::Fatal(format!("{key} must be an integer, got '{raw}'"))),
        None => Ok(default),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> CoreResult<Duration> {
    match lookup(key) {
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| CoreError::Fatal(format!("{key} must be an integer, got '{raw}'"))),
        None => Ok(default),
    }
}

fn int<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> CoreResult<T> {
    match lookup(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| CoreError::Fatal(format!("{key} must be an integer, got '{raw}'"))),
        None => Ok(default),
    }
}
