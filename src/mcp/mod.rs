//! Upstream MCP client pool (spec.md §4.6): brings up every configured
//! upstream server, registers their tools once at init, and routes
//! `listAllTools`/`getToolSchema`/`callTool`/`listAllToolSchemas`/
//! `disconnect` to the owning client.
//!
//! Grounded on the teacher's `agent/tools/mcp/mod.rs` (`McpManager::new`'s
//! connect-then-discover shape), generalized from sequential to parallel
//! connect (`futures_util::future::join_all`, as
//! `lightseekorg-smg/mcp/src/core/manager.rs` does for its own static
//! server list).

pub mod client;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::BrokerError;
use crate::pool::ConnectionPool;
use crate::schema::cache::SchemaProvider;
use crate::schema::cache::SchemaCache;
use crate::schema::{ToolSchema, ToolSchemaResponse};
use crate::toolname::ToolName;
use client::UpstreamClient;

/// Tool descriptor cache entry (spec.md §3): built once at init by
/// enumerating each upstream's tools. No I/O on lookup.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub server: String,
    pub short_name: String,
    pub description: Option<String>,
}

pub struct UpstreamClientPool {
    clients: HashMap<String, UpstreamClient>,
    /// Full tool name -> descriptor, populated once per server at connect
    /// time. Guarded by a lock only because `refresh`-style callers could
    /// want to rebuild it; normal reads never contend.
    tools: RwLock<HashMap<String, ToolDescriptor>>,
    /// Bounds concurrency across the whole fleet (spec.md §4.5), not per
    /// server — a slow upstream can't starve the others of the cap.
    pool: ConnectionPool,
}

impl UpstreamClientPool {
    /// Connect to every server in `config.mcp_servers`, skipping any entry
    /// whose name equals `config.broker_name` (self-recursion guard).
    /// Connects in parallel. If every server failed and the list was
    /// non-empty, fails init. An empty list is a valid "standalone" mode.
    pub async fn connect(config: &Config) -> Result<Self, BrokerError> {
        let entries: Vec<(&String, &crate::config::UpstreamServerConfig)> = config
            .mcp_servers
            .iter()
            .filter(|(name, _)| name.as_str() != config.broker_name)
            .collect();

        let pool = ConnectionPool::with_timeout(
            config.pool.max_connections,
            std::time::Duration::from_millis(config.pool.waiter_timeout_ms),
        );

        if entries.is_empty() {
            info!("no upstream MCP servers configured, running standalone");
            return Ok(Self {
                clients: HashMap::new(),
                tools: RwLock::new(HashMap::new()),
                pool,
            });
        }

        let attempts = entries
            .into_iter()
            .map(|(name, desc)| async move { (name.clone(), UpstreamClient::connect(name, desc).await) });
        let results = join_all(attempts).await;

        let mut clients = HashMap::new();
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(client) => {
                    clients.insert(name, client);
                }
                Err(e) => failures.push((name, e)),
            }
        }

        if clients.is_empty() && !failures.is_empty() {
            let detail = failures
                .iter()
                .map(|(name, e)| format!("{name}: {e}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(BrokerError::UpstreamFailure(format!(
                "every upstream MCP server failed to connect: {detail}"
            )));
        }
        for (name, e) in &failures {
            warn!("upstream MCP server '{name}' failed to connect: {e}");
        }

        let mut tools = HashMap::new();
        for (server_name, client) in &clients {
            match client.list_tools().await {
                Ok(discovered) => {
                    for tool in discovered {
                        let full_name = ToolName::new(server_name.clone(), tool.name.to_string()).to_string();
                        tools.insert(
                            full_name,
                            ToolDescriptor {
                                server: server_name.clone(),
                                short_name: tool.name.to_string(),
                                description: tool.description.map(|d| d.to_string()),
                            },
                        );
                    }
                }
                Err(e) => warn!("failed to list tools from '{server_name}': {e}"),
            }
        }

        Ok(Self {
            clients,
            tools: RwLock::new(tools),
            pool,
        })
    }

    /// O(1) per entry, no I/O — reads the descriptor cache built at init.
    pub async fn list_all_tools(&self) -> Vec<(String, ToolDescriptor)> {
        self.tools
            .read()
            .await
            .iter()
            .map(|(name, desc)| (name.clone(), desc.clone()))
            .collect()
    }

    /// Fetch the full tool list from the owning server and return the
    /// matching tool's input schema. Errs if the tool isn't registered.
    pub async fn get_tool_schema(&self, full_name: &str) -> Result<ToolSchema, BrokerError> {
        let tool_name: ToolName = full_name.parse()?;
        let descriptor = self
            .tools
            .read()
            .await
            .get(full_name)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("unknown tool '{full_name}'")))?;

        let client = self
            .clients
            .get(&tool_name.server)
            .ok_or_else(|| BrokerError::NotFound(format!("unknown server '{}'", tool_name.server)))?;

        let tools = client.list_tools().await?;
        let tool = tools
            .into_iter()
            .find(|t| t.name == descriptor.short_name)
            .ok_or_else(|| {
                BrokerError::NotFound(format!(
                    "tool '{}' no longer offered by server '{}'",
                    descriptor.short_name, tool_name.server
                ))
            })?;

        Ok(ToolSchema {
            name: full_name.to_string(),
            description: tool.description.map(|d| d.to_string()),
            input_schema: Value::Object((*tool.input_schema).clone()),
        })
    }

    /// Validate the name shape, look up the owning client, and forward the
    /// call through the connection pool's concurrency gate. `PoolDraining`/
    /// `QueueTimeout` propagate unchanged; the proxy maps every upstream
    /// error to a flat 500 regardless of variant (spec.md §7).
    pub async fn call_tool(&self, full_name: &str, params: Value) -> Result<Value, BrokerError> {
        let tool_name: ToolName = full_name.parse()?;
        let client = self
            .clients
            .get(&tool_name.server)
            .ok_or_else(|| BrokerError::NotFound(format!("unknown server '{}'", tool_name.server)))?;
        self.pool
            .execute(|| client.call_tool(&tool_name.tool, params))
            .await
    }

    /// Fan `cache.get_tool_schema` out over every known tool name in
    /// parallel. Per-tool failures are logged and the entry omitted —
    /// resilient aggregation, never fails the whole discovery request.
    pub async fn list_all_tool_schemas(&self, cache: &SchemaCache) -> Vec<ToolSchemaResponse> {
        let names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        let fetches = names.into_iter().map(|name| async move {
            match cache.get_tool_schema(&name).await {
                Ok(schema) => Some(ToolSchemaResponse::from(schema)),
                Err(e) => {
                    warn!("discovery: failed to fetch schema for '{name}': {e}");
                    None
                }
            }
        });
        join_all(fetches).await.into_iter().flatten().collect()
    }

    /// Close every client concurrently. Stdio children get a graceful
    /// terminate, 2s grace, then force-kill; errors probing an
    /// already-exited process are ignored.
    pub async fn disconnect(self) {
        let shutdowns = self.clients.into_values().map(UpstreamClient::shutdown);
        join_all(shutdowns).await;
    }

    pub async fn pool_stats(&self) -> crate::pool::PoolStats {
        self.pool.get_stats().await
    }
}

/// Adapts the pool to `SchemaCache`'s fetch-on-miss provider interface.
#[async_trait]
impl SchemaProvider for UpstreamClientPool {
    async fn fetch_schema(&self, full_name: &str) -> Result<ToolSchema, BrokerError> {
        self.get_tool_schema(full_name).await
    }
}

/// The proxy's view of the pool: just enough to execute and discover
/// tools. A trait boundary (rather than a concrete `UpstreamClientPool`)
/// so the proxy's route handlers can be tested against a fake without
/// spawning real upstream processes.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn call_tool(&self, full_name: &str, params: Value) -> Result<Value, BrokerError>;
    async fn list_all_tools(&self) -> Vec<(String, ToolDescriptor)>;
    async fn list_all_tool_schemas(&self, cache: &SchemaCache) -> Vec<ToolSchemaResponse>;
    async fn pool_stats(&self) -> crate::pool::PoolStats;
}

#[async_trait]
impl ToolInvoker for UpstreamClientPool {
    async fn call_tool(&self, full_name: &str, params: Value) -> Result<Value, BrokerError> {
        UpstreamClientPool::call_tool(self, full_name, params).await
    }

    async fn list_all_tools(&self) -> Vec<(String, ToolDescriptor)> {
        UpstreamClientPool::list_all_tools(self).await
    }

    async fn list_all_tool_schemas(&self, cache: &SchemaCache) -> Vec<ToolSchemaResponse> {
        UpstreamClientPool::list_all_tool_schemas(self, cache).await
    }

    async fn pool_stats(&self) -> crate::pool::PoolStats {
        UpstreamClientPool::pool_stats(self).await
    }
}

/// Wraps a pool behind an `Arc` so it can back both the schema cache (as a
/// `SchemaProvider`) and the proxy (as a `ToolInvoker`) without cloning the
/// connections themselves.
pub type SharedUpstreamPool = Arc<UpstreamClientPool>;

#[async_trait]
impl SchemaProvider for SharedUpstreamPool {
    async fn fetch_schema(&self, full_name: &str) -> Result<ToolSchema, BrokerError> {
        self.as_ref().get_tool_schema(full_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_config_is_standalone() {
        let config = Config::default();
        let pool = UpstreamClientPool::connect(&config).await.unwrap();
        assert!(pool.list_all_tools().await.is_empty());
    }

    #[tokio::test]
    async fn skips_self_named_entry() {
        let mut config = Config::default();
        config.broker_name = "self".to_string();
        config.mcp_servers.insert(
            "self".to_string(),
            crate::config::UpstreamServerConfig::Stdio {
                command: "nonexistent-binary".to_string(),
                args: vec![],
                env: HashMap::new(),
            },
        );
        // Only the self-named entry exists, so after filtering the list is
        // empty and init succeeds in standalone mode rather than trying
        // (and failing) to spawn a binary that doesn't exist.
        let pool = UpstreamClientPool::connect(&config).await.unwrap();
        assert!(pool.list_all_tools().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_tool_name_is_not_found() {
        let config = Config::default();
        let pool = UpstreamClientPool::connect(&config).await.unwrap();
        let err = pool.get_tool_schema("mcp__fs__read").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }
}
