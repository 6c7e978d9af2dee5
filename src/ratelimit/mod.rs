//! Sliding-window per-client rate limiter with per-endpoint overrides.
//!
//! Grounded on the teacher's `bus/queue/mod.rs`: a `HashMap<String, Vec<Instant>>`
//! bucket per key, pruned against a rolling cutoff on every check. The
//! `governor` crate is dropped here (see DESIGN.md) — the spec calls for the
//! exact `{allowed, remaining, retryAfter, limit}` response shape and the
//! `reset(clientId)` prefix-removal semantics, which is simplest to express
//! directly over the same bucket structure the teacher already uses.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

const DEFAULT_MAX_REQUESTS: u64 = 30;
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Result of a `checkLimit` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitCheck {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after: Option<u64>,
    pub limit: u64,
    pub window_secs: u64,
}

/// Per-endpoint override: when present, fully replaces the default
/// `{maxRequests, windowMs}` for that endpoint path.
#[derive(Debug, Clone, Copy)]
pub struct EndpointLimit {
    pub max_requests: u64,
    pub window: Duration,
}

#[derive(Debug, Clone, Default)]
struct Stats {
    allowed: u64,
    rejected: u64,
}

struct Bucket {
    timestamps: Vec<Instant>,
    stats: Stats,
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            timestamps: Vec::new(),
            stats: Stats::default(),
        }
    }
}

/// Aggregate stats for `getStats(clientId)`.
#[derive(Debug, Clone, Default)]
pub struct RateLimitStats {
    pub allowed: u64,
    pub rejected: u64,
    pub active_buckets: usize,
}

pub struct RateLimiter {
    default_max: u64,
    default_window: Duration,
    overrides: HashMap<String, EndpointLimit>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(default_max: u64, default_window: Duration) -> Self {
        Self {
            default_max,
            default_window,
            overrides: HashMap::new(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_overrides(
        default_max: u64,
        default_window: Duration,
        overrides: HashMap<String, EndpointLimit>,
    ) -> Self {
        Self {
            default_max,
            default_window,
            overrides,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn key_for(client_id: &str, endpoint: Option<&str>) -> String {
        match endpoint {
            Some(ep) => format!("{client_id}:{ep}"),
            None => client_id.to_string(),
        }
    }

    fn limit_for(&self, endpoint: Option<&str>) -> (u64, Duration) {
        if let Some(ep) = endpoint
            && let Some(over) = self.overrides.get(ep)
        {
            return (over.max_requests, over.window);
        }
        (self.default_max, self.default_window)
    }

    /// Check and, if allowed, consume one slot for `clientId` (optionally
    /// scoped to `endpoint`).
    pub async fn check_limit(&self, client_id: &str, endpoint: Option<&str>) -> LimitCheck {
        let (max_requests, window) = self.limit_for(endpoint);
        let key = Self::key_for(client_id, endpoint);
        let now = Instant::now();
        let cutoff = now.checked_sub(window).unwrap_or(now);

        let mut guard = self.buckets.lock().await;
        let bucket = guard.entry(key).or_default();
        bucket.timestamps.retain(|&t| t > cutoff);

        let count = bucket.timestamps.len() as u64;
        if count < max_requests {
            bucket.timestamps.push(now);
            bucket.stats.allowed += 1;
            LimitCheck {
                allowed: true,
                remaining: max_requests - count - 1,
                retry_after: None,
                limit: max_requests,
                window_secs: window.as_secs(),
            }
        } else {
            bucket.stats.rejected += 1;
            let oldest = bucket.timestamps.first().copied().unwrap_or(now);
            let reset_at = oldest + window;
            let retry_after = reset_at
                .checked_duration_since(now)
                .map(|d| d.as_secs_f64().ceil() as u64)
                .unwrap_or(0);
            LimitCheck {
                allowed: false,
                remaining: 0,
                retry_after: Some(retry_after),
                limit: max_requests,
                window_secs: window.as_secs(),
            }
        }
    }

    /// Remove every bucket whose key equals `clientId` or starts with
    /// `clientId:` (i.e. every per-endpoint bucket for that client too).
    pub async fn reset(&self, client_id: &str) {
        let prefix = format!("{client_id}:");
        let mut guard = self.buckets.lock().await;
        guard.retain(|k, _| k != client_id && !k.starts_with(&prefix));
    }

    /// Aggregate stats across every bucket belonging to `clientId`.
    pub async fn get_stats(&self, client_id: &str) -> RateLimitStats {
        let prefix = format!("{client_id}:");
        let guard = self.buckets.lock().await;
        let mut out = RateLimitStats::default();
        for (key, bucket) in guard.iter() {
            if key == client_id || key.starts_with(&prefix) {
                out.allowed += bucket.stats.allowed;
                out.rejected += bucket.stats.rejected;
                out.active_buckets += 1;
            }
        }
        out
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW)
    }
}
