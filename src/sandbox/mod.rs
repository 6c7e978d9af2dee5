//! Sandbox orchestrator (spec.md §2, §5): for one execution, start a fresh
//! proxy, stamp the runner with its port and bearer token, run the
//! submitted code under a caller-supplied deadline, collect its tool-call
//! history, and tear everything down on every exit path.
//!
//! The script interpreter (TypeScript) and the WebAssembly interpreter
//! (the numeric language) are external collaborators (spec.md §1) — this
//! module models only the boundary a real runner plugs into (`CodeRunner`),
//! the way `utils::subprocess::scrubbed_command` models the environment a
//! spawned upstream server gets without this crate owning the server's own
//! behavior.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::allowlist::Allowlist;
use crate::audit::AuditLogger;
use crate::errors::BrokerError;
use crate::mcp::ToolInvoker;
use crate::proxy::{ProxyConstructParams, ProxyServer};
use crate::ratelimit::RateLimiter;
use crate::schema::cache::SchemaCache;
use crate::tracker::ToolCallSummary;

/// Which runtime a submission targets (spec.md §1: "execute TypeScript" /
/// "execute Python", the latter run through a WebAssembly interpreter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    TypeScript,
    Python,
}

/// What the runner is handed before user code starts: the loopback port and
/// bearer token its injected helpers (`callMCPTool`, `discoverMCPTools`,
/// `getToolSchema`, `searchTools`, spec.md §6) must use.
#[derive(Debug, Clone)]
pub struct SandboxStamp {
    pub proxy_port: u16,
    pub proxy_token: String,
}

/// One submission to run.
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    pub timeout_ms: u64,
    /// Fully-qualified tool names this execution may invoke through the
    /// proxy. Constructed fresh per call — never shared across executions
    /// (spec.md §5, "Shared-resource policy").
    pub allowed_tools: Vec<String>,
}

/// What a runner returns on a clean (non-timeout) finish.
#[derive(Debug, Clone)]
pub struct RunnerOutcome {
    pub output: Value,
    pub error: Option<String>,
}

/// The boundary the actual script interpreter / WASM runtime plugs into.
/// Implementors own the child process or in-process VM and must kill it if
/// their `run` future is dropped before resolving — the orchestrator relies
/// on cancel-on-drop to honor the "force-killed on timeout expiry"
/// requirement (spec.md §5) rather than sending a kill signal itself, since
/// it never knows the runner's process identifier.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(
        &self,
        code: &str,
        language: Language,
        stamp: &SandboxStamp,
    ) -> Result<RunnerOutcome, BrokerError>;
}

/// Returned to the outer MCP tool handler (spec.md §3, "Execution result").
/// `stream_url`/`sampling_calls`/`sampling_metrics` name fields the
/// streaming proxy and sampling bridge would populate; both remain
/// out-of-scope collaborators (spec.md §1 Non-goals), so these are always
/// `None` here.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub tool_calls_made: Vec<String>,
    pub tool_call_summary: Vec<ToolCallSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_metrics: Option<Value>,
}

impl ExecutionResult {
    fn failure(message: String, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(message),
            execution_time_ms,
            tool_calls_made: Vec::new(),
            tool_call_summary: Vec::new(),
            stream_url: None,
            sampling_calls: None,
            sampling_metrics: None,
        }
    }
}

/// Process-wide dependencies shared across every execution (schema cache,
/// upstream pool, audit logger): constructed once in `main`, never torn
/// down per-execution. Per-execution state (proxy, allowlist, tracker,
/// rate limiter, bearer token) is built fresh inside `execute`.
pub struct SandboxOrchestrator {
    upstream_pool: Arc<dyn ToolInvoker>,
    schema_cache: Arc<SchemaCache>,
    audit: Arc<AuditLogger>,
    runner: Arc<dyn CodeRunner>,
    discovery_timeout: Duration,
    rate_limit_max: u64,
    rate_limit_window: Duration,
}

impl SandboxOrchestrator {
    pub fn new(
        upstream_pool: Arc<dyn ToolInvoker>,
        schema_cache: Arc<SchemaCache>,
        audit: Arc<AuditLogger>,
        runner: Arc<dyn CodeRunner>,
        discovery_timeout: Duration,
        rate_limit_max: u64,
        rate_limit_window: Duration,
    ) -> Self {
        Self {
            upstream_pool,
            schema_cache,
            audit,
            runner,
            discovery_timeout,
            rate_limit_max,
            rate_limit_window,
        }
    }

    /// Start a fresh proxy, run the submission under `request.timeout_ms`,
    /// then tear the proxy down unconditionally. Success, runner failure,
    /// and timeout all fall through to the same `stop()` call — the
    /// guaranteed-release path spec.md §5 requires regardless of outcome.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let allowlist = Allowlist::new(request.allowed_tools);
        let rate_limiter = RateLimiter::new(self.rate_limit_max, self.rate_limit_window);

        let mut proxy = ProxyServer::new(ProxyConstructParams {
            upstream_pool: self.upstream_pool.clone(),
            allowlist,
            schema_cache: self.schema_cache.clone(),
            rate_limiter,
            audit: self.audit.clone(),
            discovery_timeout: self.discovery_timeout,
        });

        let start_result = match proxy.start().await {
            Ok(r) => r,
            Err(e) => {
                return ExecutionResult::failure(
                    format!("failed to start proxy: {e}"),
                    started.elapsed().as_millis() as u64,
                );
            }
        };

        let stamp = SandboxStamp {
            proxy_port: start_result.port,
            proxy_token: start_result.auth_token,
        };
        let tracker = proxy.tracker();
        let timeout = Duration::from_millis(request.timeout_ms);

        let outcome = tokio::time::timeout(
            timeout,
            self.runner.run(&request.code, request.language, &stamp),
        )
        .await;

        let execution_time_ms = started.elapsed().as_millis() as u64;
        let tool_calls_made = tracker.get_unique_calls().await;
        let tool_call_summary = tracker.get_summary().await;

        // Guaranteed release: the proxy (and the rate limiter, tracker, and
        // allowlist it owns) is torn down no matter which branch below ran.
        proxy.stop().await;

        match outcome {
            Ok(Ok(runner_outcome)) => ExecutionResult {
                success: runner_outcome.error.is_none(),
                output: runner_outcome.output,
                error: runner_outcome.error,
                execution_time_ms,
                tool_calls_made,
                tool_call_summary,
                stream_url: None,
                sampling_calls: None,
                sampling_metrics: None,
            },
            Ok(Err(e)) => ExecutionResult {
                success: false,
                output: Value::Null,
                error: Some(e.to_string()),
                execution_time_ms,
                tool_calls_made,
                tool_call_summary,
                stream_url: None,
                sampling_calls: None,
                sampling_metrics: None,
            },
            Err(_) => {
                warn!(
                    "execution exceeded {}ms, runner future dropped (force-kill is the runner's responsibility)",
                    request.timeout_ms
                );
                ExecutionResult {
                    success: false,
                    output: Value::Null,
                    error: Some(format!("execution timed out after {}ms", request.timeout_ms)),
                    execution_time_ms,
                    tool_calls_made,
                    tool_call_summary,
                    stream_url: None,
                    sampling_calls: None,
                    sampling_metrics: None,
                }
            }
        }
    }
}
