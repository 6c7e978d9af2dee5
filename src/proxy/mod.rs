//! Per-execution loopback proxy/discovery HTTP server (spec.md §4.7).
//!
//! Grounded on the teacher's `gateway/mod.rs` (`HttpApiState` + `axum::
//! Router` pattern, `subtle::ConstantTimeEq` token comparison), generalized
//! from webhook-signature checking to bearer-token auth and from a
//! long-lived gateway to a short-lived, per-execution instance bound to an
//! ephemeral loopback port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::allowlist::Allowlist;
use crate::audit::{AuditLogger, AuditStatus, AuditEntry, EventType, sha256_hex};
use crate::errors::BrokerError;
use crate::mcp::ToolInvoker;
use crate::ratelimit::RateLimiter;
use crate::schema::cache::SchemaCache;
use crate::schema::validator;
use crate::tracker::{CallStatus, ToolCallRecord, ToolCallTracker};

/// The proxy serves exactly one execution, so every discovery request is
/// attributed to this fixed key for rate-limiting purposes.
const DISCOVERY_CLIENT_KEY: &str = "discovery";
const DISCOVERY_ENDPOINT: &str = "mcp_tools";
const MAX_QUERY_TERM_LEN: usize = 100;

pub struct ProxyConstructParams {
    pub upstream_pool: Arc<dyn ToolInvoker>,
    pub allowlist: Allowlist,
    pub schema_cache: Arc<SchemaCache>,
    pub rate_limiter: RateLimiter,
    pub audit: Arc<AuditLogger>,
    pub discovery_timeout: Duration,
}

#[derive(Clone)]
struct ProxyState {
    upstream_pool: Arc<dyn ToolInvoker>,
    allowlist: Arc<Allowlist>,
    schema_cache: Arc<SchemaCache>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditLogger>,
    tracker: Arc<ToolCallTracker>,
    discovery_timeout: Duration,
    auth_token: Arc<String>,
}

pub struct StartResult {
    pub port: u16,
    pub auth_token: String,
}

/// Per-execution proxy. Not `Clone` — owned by exactly one execution's
/// orchestrator, which must call `stop()` on every exit path.
pub struct ProxyServer {
    state: ProxyState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ProxyServer {
    pub fn new(params: ProxyConstructParams) -> Self {
        let auth_token = generate_bearer_token();
        let state = ProxyState {
            upstream_pool: params.upstream_pool,
            allowlist: Arc::new(params.allowlist),
            schema_cache: params.schema_cache,
            rate_limiter: Arc::new(params.rate_limiter),
            audit: params.audit,
            tracker: Arc::new(ToolCallTracker::new()),
            discovery_timeout: params.discovery_timeout,
            auth_token: Arc::new(auth_token),
        };
        Self {
            state,
            shutdown_tx: None,
            join_handle: None,
        }
    }

    pub fn tracker(&self) -> Arc<ToolCallTracker> {
        self.state.tracker.clone()
    }

    /// Pre-populate the schema cache (best-effort), bind to an ephemeral
    /// loopback port, and start serving. A bind failure rejects immediately
    /// rather than hanging.
    pub async fn start(&mut self) -> Result<StartResult, BrokerError> {
        let known_tools: Vec<String> = self
            .state
            .upstream_pool
            .list_all_tools()
            .await
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        self.state.schema_cache.pre_populate(&known_tools).await;

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("failed to bind proxy: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("reading bound addr: {e}")))?
            .port();

        let app = build_router(self.state.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                warn!("proxy server error: {e}");
            }
        });

        self.shutdown_tx = Some(shutdown_tx);
        self.join_handle = Some(handle);

        info!("proxy listening on 127.0.0.1:{port}");
        Ok(StartResult {
            port,
            auth_token: (*self.state.auth_token).clone(),
        })
    }

    /// Signal graceful shutdown, then force-abort if it hasn't finished
    /// within 1 second.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.join_handle.take() {
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                warn!("proxy did not shut down within 1s, aborting task");
            }
        }
    }
}

fn generate_bearer_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/", post(execute_handler))
        .route("/mcp/tools", get(discovery_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

/// Constant-time bearer check. Every real token is 64 hex chars, so the
/// length check never distinguishes one real token from another.
fn check_auth(headers: &HeaderMap, expected: &str) -> bool {
    let Some(raw) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(token) = raw.strip_prefix("Bearer ") else {
        return false;
    };
    if token.len() != expected.len() {
        return false;
    }
    token.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn unauthorized_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "unauthorized",
            "hint": "requests must carry 'Authorization: Bearer <token>'"
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    #[serde(rename = "toolName")]
    tool_name: String,
    #[serde(default)]
    params: Value,
}

/// Authenticates before looking at the body at all, so a malformed or
/// `toolName`-less request from an unauthenticated caller still gets `401`
/// rather than axum's extractor-rejection `400`/`422` (state machine is
/// `recv -> authn -> ...`, per spec.md §4.7). The body is therefore taken as
/// raw bytes and projected into `ExecuteRequest` by hand after auth passes.
async fn execute_handler(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let correlation_id = Uuid::new_v4().to_string();

    if !check_auth(&headers, &state.auth_token) {
        state
            .audit
            .log(&AuditEntry {
                timestamp: chrono::Utc::now(),
                correlation_id,
                event_type: EventType::AuthFailure,
                client_id: None,
                client_ip: None,
                tool_name: None,
                params_hash: None,
                status: AuditStatus::Rejected,
                error_message: None,
                latency_ms: None,
                metadata: None,
            })
            .await
            .ok();
        return unauthorized_response();
    }

    let body: ExecuteRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid request body: {e}") })),
            )
                .into_response();
        }
    };

    if !state.allowlist.is_allowed(&body.tool_name) {
        let allowed = state.allowlist.get_allowed_tools();
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": format!("Tool '{}' not in allowlist", body.tool_name),
                "allowedTools": allowed,
                "suggestion": format!("Add '{}' to allowedTools array", body.tool_name),
            })),
        )
            .into_response();
    }

    match state.schema_cache.get_tool_schema(&body.tool_name).await {
        Ok(schema) => {
            let result = validator::validate(&schema.input_schema, &body.params);
            if !result.valid {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": result.errors.join("; ") })),
                )
                    .into_response();
            }
        }
        Err(e) => {
            warn!("schema fetch failed for '{}': {e}, forwarding without validation", body.tool_name);
        }
    }

    let params_hash = sha256_hex(&body.params.to_string());
    let start = Instant::now();
    let outcome = state.upstream_pool.call_tool(&body.tool_name, body.params.clone()).await;
    let duration = start.elapsed();

    let (status, error_message, response) = match &outcome {
        Ok(result) => (CallStatus::Success, None, (StatusCode::OK, Json(json!({ "result": result }))).into_response()),
        Err(e) => {
            let message = e.to_string();
            (
                CallStatus::Error,
                Some(message.clone()),
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": message }))).into_response(),
            )
        }
    };

    state
        .tracker
        .record(ToolCallRecord {
            tool_name: body.tool_name.clone(),
            duration_ms: duration.as_millis() as u64,
            status,
            error_message: error_message.clone(),
            timestamp: chrono::Utc::now(),
        })
        .await;

    state
        .audit
        .log(&AuditEntry {
            timestamp: chrono::Utc::now(),
            correlation_id,
            event_type: EventType::ToolCall,
            client_id: None,
            client_ip: None,
            tool_name: Some(body.tool_name),
            params_hash: Some(params_hash),
            status: match status {
                CallStatus::Success => AuditStatus::Success,
                CallStatus::Error => AuditStatus::Failure,
            },
            error_message,
            latency_ms: Some(duration.as_millis() as u64),
            metadata: None,
        })
        .await
        .ok();

    response
}

/// Collect every repeated `q` parameter. `axum`'s built-in `Query`
/// extractor deserializes a flat map and silently drops repeats, so `?q=a&
/// q=b` is parsed by hand against the raw query string instead.
fn collect_q_params(raw_query: Option<&str>) -> Vec<String> {
    let Some(raw) = raw_query else {
        return Vec::new();
    };
    form_urlencoded::parse(raw.as_bytes())
        .filter(|(k, _)| k == "q")
        .map(|(_, v)| v.into_owned())
        .collect()
}

/// Discovery deliberately bypasses the allowlist: it only ever exposes
/// read-only metadata (name, description, schema) and never invokes a
/// tool, so gating it would block agents from learning what they're
/// allowed to ask to have added to the allowlist in the first place.
async fn discovery_handler(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Response {
    if !check_auth(&headers, &state.auth_token) {
        return unauthorized_response();
    }

    let check = state
        .rate_limiter
        .check_limit(DISCOVERY_CLIENT_KEY, Some(DISCOVERY_ENDPOINT))
        .await;
    if !check.allowed {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "rate limit exceeded",
                "retryAfter": check.retry_after,
                "limit": check.limit,
                "window": check.window_secs,
            })),
        )
            .into_response();
    }

    let query_terms = collect_q_params(raw_query.as_deref());
    for term in &query_terms {
        let valid_chars = term
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '_' || c == '-');
        if term.len() > MAX_QUERY_TERM_LEN || !valid_chars {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid search term '{term}'") })),
            )
                .into_response();
        }
    }

    let fetch = state.upstream_pool.list_all_tool_schemas(&state.schema_cache);
    let schemas = match tokio::time::timeout(state.discovery_timeout, fetch).await {
        Ok(schemas) => schemas,
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "discovery timed out" })),
            )
                .into_response();
        }
    };

    let keywords: Vec<String> = query_terms.iter().map(|q| q.to_lowercase()).collect();
    let filtered: Vec<&crate::schema::ToolSchemaResponse> = schemas
        .iter()
        .filter(|t| {
            if keywords.is_empty() {
                return true;
            }
            let haystack = format!(
                "{} {}",
                t.name.to_lowercase(),
                t.description.as_deref().unwrap_or("").to_lowercase()
            );
            keywords.iter().any(|k| haystack.contains(k.as_str()))
        })
        .collect();

    state
        .audit
        .log(&AuditEntry {
            timestamp: chrono::Utc::now(),
            correlation_id: Uuid::new_v4().to_string(),
            event_type: EventType::Discovery,
            client_id: None,
            client_ip: None,
            tool_name: None,
            params_hash: None,
            status: AuditStatus::Success,
            error_message: None,
            latency_ms: None,
            metadata: Some(json!({ "query": query_terms, "resultCount": filtered.len() })),
        })
        .await
        .ok();

    (StatusCode::OK, Json(json!({ "tools": filtered }))).into_response()
}

async fn metrics_handler(State(state): State<ProxyState>, headers: HeaderMap) -> Response {
    if !check_auth(&headers, &state.auth_token) {
        return unauthorized_response();
    }
    let cache_stats = state.schema_cache.get_stats().await;
    let rate_stats = state.rate_limiter.get_stats(DISCOVERY_CLIENT_KEY).await;
    let tracker_summary = state.tracker.get_summary().await;
    let pool_stats = state.upstream_pool.pool_stats().await;

    (
        StatusCode::OK,
        Json(json!({
            "cache": { "size": cache_stats.size, "capacity": cache_stats.capacity },
            "rateLimit": { "allowed": rate_stats.allowed, "rejected": rate_stats.rejected },
            "pool": {
                "active": pool_stats.active,
                "max": pool_stats.max,
                "waiting": pool_stats.waiting,
                "draining": pool_stats.draining,
            },
            "tools": tracker_summary,
        })),
    )
        .into_response()
}

async fn fallback_handler() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "not found",
            "routes": ["POST /", "GET /mcp/tools", "GET /metrics"],
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests;
