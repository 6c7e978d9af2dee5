//! A single connection to one upstream MCP server.
//!
//! Grounded on the teacher's `agent/tools/mcp/mod.rs` (`RunningMcpServer`,
//! `connect_server`) for the stdio path, generalized with the streaming-
//! HTTP-first / SSE-fallback transport selection from
//! `lightseekorg-smg/mcp/src/core/manager.rs`'s `connect_server_impl`.

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

use rmcp::model::{CallToolRequestParams, RawContent};
use rmcp::service::RunningService;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{RoleClient, ServiceExt};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::UpstreamServerConfig;
use crate::errors::BrokerError;
use crate::utils::subprocess::scrubbed_command;

/// 2 seconds between a graceful terminate signal and a force-kill, per
/// spec.md §4.6.
const GRACE_PERIOD: Duration = Duration::from_secs(2);

pub struct UpstreamClient {
    pub server_name: String,
    client: RunningService<RoleClient, ()>,
    pid: Option<u32>,
}

impl UpstreamClient {
    pub async fn connect(name: &str, config: &UpstreamServerConfig) -> Result<Self, BrokerError> {
        match config {
            UpstreamServerConfig::Stdio { command, args, env } => {
                Self::connect_stdio(name, command, args, env).await
            }
            UpstreamServerConfig::Http { url, headers, .. } => {
                Self::connect_http(name, url, headers).await
            }
        }
    }

    async fn connect_stdio(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, BrokerError> {
        let mut cmd = scrubbed_command(command);
        cmd.args(args);
        for (k, v) in env {
            cmd.env(k, v);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::inherit());

        let transport = TokioChildProcess::new(cmd).map_err(|e| {
            BrokerError::UpstreamFailure(format!(
                "failed to spawn stdio transport for '{name}': {e}"
            ))
        })?;
        let pid = transport.id();

        let client = ().serve(transport).await.map_err(|e| {
            BrokerError::UpstreamFailure(format!("MCP handshake failed for '{name}': {e}"))
        })?;

        info!("connected to stdio MCP server '{name}'");
        Ok(Self {
            server_name: name.to_string(),
            client,
            pid,
        })
    }

    async fn connect_http(
        name: &str,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, BrokerError> {
        match Self::connect_streamable(url, headers).await {
            Ok(client) => {
                info!("connected to streaming HTTP MCP server '{name}' at {url}");
                return Ok(Self {
                    server_name: name.to_string(),
                    client,
                    pid: None,
                });
            }
            Err(e) => {
                warn!(
                    "streaming HTTP transport failed for '{name}' ({e}), falling back to SSE"
                );
            }
        }

        let client = Self::connect_sse(url, headers).await.map_err(|e| {
            BrokerError::UpstreamFailure(format!(
                "both streaming HTTP and SSE transports failed for '{name}': {e}"
            ))
        })?;
        info!("connected to SSE MCP server '{name}' at {url}");
        Ok(Self {
            server_name: name.to_string(),
            client,
            pid: None,
        })
    }

    async fn connect_streamable(
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<RunningService<RoleClient, ()>, BrokerError> {
        let mut config = StreamableHttpClientTransportConfig::with_uri(url);
        if let Some(auth) = headers.get("Authorization") {
            config.auth_header = Some(auth.clone());
        }
        let transport = StreamableHttpClientTransport::from_config(config);
        ().serve(transport)
            .await
            .map_err(|e| BrokerError::UpstreamFailure(format!("streamable transport: {e}")))
    }

    async fn connect_sse(
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<RunningService<RoleClient, ()>, BrokerError> {
        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
        if !headers.is_empty() {
            let mut header_map = reqwest::header::HeaderMap::new();
            for (k, v) in headers {
                let Ok(name) = reqwest::header::HeaderName::from_bytes(k.as_bytes()) else {
                    continue;
                };
                let Ok(value) = reqwest::header::HeaderValue::from_str(v) else {
                    continue;
                };
                header_map.insert(name, value);
            }
            builder = builder.default_headers(header_map);
        }
        let http_client = builder
            .build()
            .map_err(|e| BrokerError::UpstreamFailure(format!("building SSE http client: {e}")))?;

        let transport = SseClientTransport::start_with_client(http_client, url.into())
            .await
            .map_err(|e| BrokerError::UpstreamFailure(format!("SSE transport: {e}")))?;

        ().serve(transport)
            .await
            .map_err(|e| BrokerError::UpstreamFailure(format!("SSE transport handshake: {e}")))
    }

    pub async fn list_tools(&self) -> Result<Vec<rmcp::model::Tool>, BrokerError> {
        self.client
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| BrokerError::UpstreamFailure(format!("listing tools: {e}")))
    }

    pub async fn call_tool(&self, tool_name: &str, params: Value) -> Result<Value, BrokerError> {
        let arguments = match params {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("input".to_string(), other);
                Some(map)
            }
        };

        let request = CallToolRequestParams {
            meta: None,
            name: Cow::Owned(tool_name.to_string()),
            arguments,
            task: None,
        };

        let result = self
            .client
            .peer()
            .call_tool(request)
            .await
            .map_err(|e| BrokerError::UpstreamFailure(format!("tool '{tool_name}' failed: {e}")))?;

        if result.is_error.unwrap_or(false) {
            let message = first_text(&result.content).unwrap_or_else(|| "tool returned an error".to_string());
            return Err(BrokerError::UpstreamFailure(format!(
                "tool '{tool_name}' returned an error: {message}"
            )));
        }

        match first_text(&result.content) {
            Some(text) => Ok(Value::String(text)),
            None => serde_json::to_value(&result.content)
                .map_err(|e| BrokerError::Internal(anyhow::anyhow!("serializing tool result: {e}"))),
        }
    }

    /// Send a terminate signal, wait the grace period, probe with a
    /// no-op signal, and force-kill if still alive. Ignores
    /// already-exited ("no such process") errors. Then closes the RPC
    /// transport. No-op for HTTP clients (no child process to signal).
    pub async fn shutdown(self) {
        if let Some(pid) = self.pid {
            graceful_kill(pid).await;
        }
        if let Err(e) = self.client.cancel().await {
            warn!("error closing MCP client '{}': {e}", self.server_name);
        }
    }
}

fn first_text(content: &[rmcp::model::Content]) -> Option<String> {
    content.iter().find_map(|c| match &c.raw {
        RawContent::Text(t) => Some(t.text.clone()),
        _ => None,
    })
}

#[cfg(unix)]
async fn graceful_kill(pid: u32) {
    let pid = pid as libc::pid_t;
    // SAFETY: `kill(2)` with a signal is always safe to call; failures are
    // reported via errno, not UB. ESRCH (no such process) is expected when
    // the child already exited.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    tokio::time::sleep(GRACE_PERIOD).await;
    let still_alive = unsafe { libc::kill(pid, 0) } == 0;
    if still_alive {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
async fn graceful_kill(_pid: u32) {}
