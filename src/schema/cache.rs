//! In-memory LRU + disk-persisted schema cache with TTL, stale-on-error
//! serving, and request coalescing.
//!
//! Grounded on the teacher's `agent/tools/registry/mod.rs` `CacheMiddleware`
//! (LRU + `Instant`-based TTL), generalized with disk persistence (via
//! `utils::atomic_write`) and coalescing of concurrent fetches for the same
//! tool name (a `Shared` future per in-flight key, cleared once resolved).

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use futures_util::future::Shared;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::BrokerError;
use crate::schema::ToolSchema;

type FetchFuture = Shared<futures_util::future::BoxFuture<'static, Result<ToolSchema, String>>>;

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_CAP: usize = 1000;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A cache entry as persisted to disk: `{schema, fetchedAt, expiresAt}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    schema: ToolSchema,
    fetched_at: u64,
    expires_at: u64,
}

/// Aggregate statistics for `getStats()`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
}

/// Anything that can fetch a tool's schema on a cache miss. The proxy wires
/// this to the upstream client pool's `getToolSchema`.
#[async_trait::async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn fetch_schema(&self, full_name: &str) -> Result<ToolSchema, BrokerError>;
}

struct Inner {
    entries: LruCache<String, CacheEntry>,
    in_flight: HashMap<String, FetchFuture>,
}

/// Process-wide schema cache singleton.
pub struct SchemaCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    capacity: usize,
    disk_path: Option<PathBuf>,
    provider: Arc<dyn SchemaProvider>,
}

impl SchemaCache {
    pub fn new(provider: Arc<dyn SchemaProvider>, disk_path: Option<PathBuf>) -> Self {
        Self::with_options(provider, disk_path, DEFAULT_TTL, DEFAULT_CAP)
    }

    pub fn with_options(
        provider: Arc<dyn SchemaProvider>,
        disk_path: Option<PathBuf>,
        ttl: Duration,
        capacity: usize,
    ) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(cap),
                in_flight: HashMap::new(),
            }),
            ttl,
            capacity,
            disk_path,
            provider,
        }
    }

    /// Load the on-disk cache file, sort by `fetchedAt` descending, keep
    /// only the newest `capacity` entries. A missing or malformed file is
    /// not an error — the cache simply starts empty.
    pub async fn load_from_disk(&self) {
        let Some(path) = &self.disk_path else {
            return;
        };
        let Ok(content) = tokio::fs::read_to_string(path).await else {
            return;
        };
        let Ok(map) = serde_json::from_str::<HashMap<String, CacheEntry>>(&content) else {
            warn!("schema cache file at {} is malformed, starting empty", path.display());
            return;
        };

        let mut entries: Vec<(String, CacheEntry)> = map.into_iter().collect();
        entries.sort_by(|a, b| b.1.fetched_at.cmp(&a.1.fetched_at));
        entries.truncate(self.capacity);

        let mut guard = self.inner.lock().await;
        for (name, entry) in entries {
            guard.entries.put(name, entry);
        }
    }

    /// Fire-and-forget persistence of the whole cache to disk.
    async fn persist(&self) {
        let Some(path) = self.disk_path.clone() else {
            return;
        };
        let snapshot: HashMap<String, CacheEntry> = {
            let guard = self.inner.lock().await;
            guard
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        tokio::task::spawn_blocking(move || {
            let Ok(content) = serde_json::to_string_pretty(&snapshot) else {
                return;
            };
            if let Err(e) = crate::utils::atomic_write(&path, &content) {
                warn!("failed to persist schema cache to {}: {e}", path.display());
            }
        });
    }

    /// Fetch a tool's schema, applying coalescing, TTL, and stale-on-error.
    pub async fn get_tool_schema(&self, full_name: &str) -> Result<ToolSchema, BrokerError> {
        // Fast path: fresh cache hit.
        {
            let mut guard = self.inner.lock().await;
            if let Some(entry) = guard.entries.get(full_name) {
                let now = now_millis();
                if now < entry.expires_at {
                    return Ok(entry.schema.clone());
                }
            }
        }

        // Coalesce concurrent misses for the same name.
        let fut = {
            let mut guard = self.inner.lock().await;
            if let Some(existing) = guard.in_flight.get(full_name) {
                existing.clone()
            } else {
                let provider = self.provider.clone();
                let name = full_name.to_string();
                let task: futures_util::future::BoxFuture<'static, Result<ToolSchema, String>> =
                    Box::pin(async move { provider.fetch_schema(&name).await.map_err(|e| e.to_string()) });
                let shared = task.shared();
                guard.in_flight.insert(full_name.to_string(), shared.clone());
                shared
            }
        };

        let result = fut.await;

        {
            let mut guard = self.inner.lock().await;
            guard.in_flight.remove(full_name);
        }

        match result {
            Ok(schema) => {
                let fetched_at = now_millis();
                let expires_at = fetched_at + self.ttl.as_millis() as u64;
                let entry = CacheEntry {
                    schema: schema.clone(),
                    fetched_at,
                    expires_at,
                };
                {
                    let mut guard = self.inner.lock().await;
                    guard.entries.put(full_name.to_string(), entry);
                }
                self.persist().await;
                Ok(schema)
            }
            Err(e) => {
                let mut guard = self.inner.lock().await;
                if let Some(stale) = guard.entries.peek(full_name).cloned() {
                    debug!("serving stale schema for '{full_name}' after fetch error: {e}");
                    return Ok(stale.schema);
                }
                Err(BrokerError::UpstreamFailure(format!(
                    "failed to fetch schema for '{full_name}': {e}"
                )))
            }
        }
    }

    /// Drop one entry, or every entry when `full_name` is `None`. Flushes
    /// to disk afterwards.
    pub async fn invalidate(&self, full_name: Option<&str>) {
        {
            let mut guard = self.inner.lock().await;
            match full_name {
                Some(name) => {
                    guard.entries.pop(name);
                }
                None => {
                    guard.entries.clear();
                }
            }
        }
        self.persist().await;
    }

    /// Load from disk, then fetch in parallel only the tool names that are
    /// missing or expired. Per-tool failures are logged and skipped.
    pub async fn pre_populate(&self, known_tool_names: &[String]) {
        self.load_from_disk().await;

        let mut to_fetch = Vec::new();
        {
            let guard = self.inner.lock().await;
            let now = now_millis();
            for name in known_tool_names {
                match guard.entries.peek(name) {
                    Some(entry) if now < entry.expires_at => {}
                    _ => to_fetch.push(name.clone()),
                }
            }
        }

        let fetches = to_fetch
            .into_iter()
            .map(|name| async move {
                if let Err(e) = self.get_tool_schema(&name).await {
                    warn!("pre-populate: failed to fetch schema for '{name}': {e}");
                }
            });
        futures_util::future::join_all(fetches).await;
    }

    /// Synchronously drop every expired entry, return the count removed.
    pub async fn cleanup(&self) -> usize {
        let mut guard = self.inner.lock().await;
        let now = now_millis();
        let expired: Vec<String> = guard
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            guard.entries.pop(key);
        }
        expired.len()
    }

    pub async fn get_stats(&self) -> CacheStats {
        let guard = self.inner.lock().await;
        CacheStats {
            size: guard.entries.len(),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests;
