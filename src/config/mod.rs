//! Broker configuration: upstream MCP servers plus the proxy/cache/rate
//! limit/pool/audit sections.
//!
//! Grounded on the teacher's `config/schema/tools.rs` (`McpConfig`/
//! `McpServerConfig` camelCase pattern) and `config/loader/mod.rs` (shared
//! lock on read, atomic tempfile+rename write, permission warnings),
//! trimmed down to only the sections this broker needs. This is
//! deliberately NOT the config-discovery layer itself (file search, env
//! overlay) — that remains an external collaborator per spec.md §1; the
//! broker accepts a single explicit path, defaulting to
//! `BROKER_HOME/config.json`.

pub mod loader;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use loader::{get_config_path, load_config, save_config};

/// One entry of the `mcpServers` map: either a stdio child process or a
/// streaming-HTTP server. Untagged so the wire shape matches spec.md §6
/// exactly (`{"command":...}` vs `{"url":...,"type":"http"}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpstreamServerConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, rename = "type")]
        #[allow(dead_code)]
        kind: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
}

impl ProxyConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: default_discovery_timeout_ms(),
        }
    }
}

fn default_discovery_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Override the schema cache file path; defaults to
    /// `<broker_home>/schema-cache.json`.
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            capacity: default_cache_capacity(),
            path: None,
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_cache_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitEndpointOverride {
    pub max_requests: u64,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_max")]
    pub default_max_requests: u64,
    #[serde(default = "default_rate_limit_window_secs")]
    pub default_window_secs: u64,
    #[serde(default)]
    pub overrides: HashMap<String, RateLimitEndpointOverride>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_max_requests: default_rate_limit_max(),
            default_window_secs: default_rate_limit_window_secs(),
            overrides: HashMap::new(),
        }
    }
}

fn default_rate_limit_max() -> u64 {
    30
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    #[serde(default = "default_pool_max")]
    pub max_connections: usize,
    #[serde(default = "default_pool_waiter_timeout_ms")]
    pub waiter_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_pool_max(),
            waiter_timeout_ms: default_pool_waiter_timeout_ms(),
        }
    }
}

fn default_pool_max() -> usize {
    8
}

fn default_pool_waiter_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Override the audit log directory; defaults to `<broker_home>/audit`.
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            dir: None,
        }
    }
}

fn default_retention_days() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// This broker's own server name; an entry in `mcpServers` matching
    /// this name is skipped at init to prevent self-recursion.
    #[serde(default = "default_broker_name")]
    pub broker_name: String,
    #[serde(default)]
    pub mcp_servers: HashMap<String, UpstreamServerConfig>,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

fn default_broker_name() -> String {
    "broker".to_string()
}
