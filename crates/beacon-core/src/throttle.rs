//! Fixed-window rate limiter for the request paths that need one (broadcast
//! creation, per-user stream connects).  In-process by design: limits are
//! per instance, enforced before any durable work starts.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    hits: Mutex<HashMap<String, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        RateLimiter {
            max_per_window: max_per_window.max(1),
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hit for `key`; `false` means the window is exhausted.
    pub async fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;
        // Opportunistic cleanup keeps the map from accumulating dead keys.
        hits.retain(|_, (start, _)| now.duration_since(*start) < self.window);
        match hits.get_mut(key) {
            Some((start, count)) if now.duration_since(*start) < self.window => {
                if *count >= self.max_per_window {
                    return false;
                }
                *count += 1;
                true
            }
            _ => {
                hits.insert(key.to_owned(), (now, 1));
                true
            }
        }
    }
}
