use super::*;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use tempfile::tempdir;
use tower::ServiceExt;

use crate::mcp::ToolDescriptor;
use crate::schema::ToolSchema;

struct FakeInvoker {
    tools: HashMap<String, ToolDescriptor>,
    schemas: HashMap<String, Value>,
    response: StdMutex<Result<Value, String>>,
    calls: StdMutex<Vec<String>>,
}

impl FakeInvoker {
    fn new() -> Self {
        let mut tools = HashMap::new();
        tools.insert(
            "mcp__fs__read".to_string(),
            ToolDescriptor {
                server: "fs".to_string(),
                short_name: "read".to_string(),
                description: Some("reads a file".to_string()),
            },
        );
        let mut schemas = HashMap::new();
        schemas.insert(
            "mcp__fs__read".to_string(),
            json!({
                "type": "object",
                "required": ["path"],
                "properties": { "path": { "type": "string" } }
            }),
        );
        Self {
            tools,
            schemas,
            response: StdMutex::new(Ok(json!("file contents"))),
            calls: StdMutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ToolInvoker for FakeInvoker {
    async fn call_tool(&self, full_name: &str, _params: Value) -> Result<Value, BrokerError> {
        self.calls.lock().unwrap().push(full_name.to_string());
        self.response
            .lock()
            .unwrap()
            .clone()
            .map_err(BrokerError::UpstreamFailure)
    }

    async fn list_all_tools(&self) -> Vec<(String, ToolDescriptor)> {
        self.tools
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    async fn list_all_tool_schemas(&self, _cache: &SchemaCache) -> Vec<crate::schema::ToolSchemaResponse> {
        self.schemas
            .iter()
            .map(|(name, schema)| crate::schema::ToolSchemaResponse {
                name: name.clone(),
                description: self.tools.get(name).and_then(|t| t.description.clone()),
                parameters: schema.clone(),
            })
            .collect()
    }

    async fn pool_stats(&self) -> crate::pool::PoolStats {
        crate::pool::PoolStats::default()
    }
}

struct NoopProvider;

#[async_trait]
impl crate::schema::cache::SchemaProvider for NoopProvider {
    async fn fetch_schema(&self, full_name: &str) -> Result<ToolSchema, BrokerError> {
        Err(BrokerError::NotFound(format!("no such tool '{full_name}'")))
    }
}

fn test_state(allowlist: Vec<String>) -> (ProxyState, Arc<FakeInvoker>) {
    let invoker = Arc::new(FakeInvoker::new());
    let dir = tempdir().unwrap();
    let schema_cache = Arc::new(SchemaCache::new(Arc::new(NoopProvider), None));
    let audit = Arc::new(AuditLogger::new(dir.path().to_path_buf(), 30));
    let state = ProxyState {
        upstream_pool: invoker.clone(),
        allowlist: Arc::new(Allowlist::new(allowlist)),
        schema_cache,
        rate_limiter: Arc::new(RateLimiter::new(30, Duration::from_secs(60))),
        audit,
        tracker: Arc::new(ToolCallTracker::new()),
        discovery_timeout: Duration::from_millis(500),
        auth_token: Arc::new("deadbeef".repeat(8)),
    };
    (state, invoker)
}

struct FixedSchemaProvider(Value);

#[async_trait]
impl crate::schema::cache::SchemaProvider for FixedSchemaProvider {
    async fn fetch_schema(&self, full_name: &str) -> Result<ToolSchema, BrokerError> {
        Ok(ToolSchema {
            name: full_name.to_string(),
            description: None,
            input_schema: self.0.clone(),
        })
    }
}

fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

#[tokio::test]
async fn invalid_params_return_400_before_forwarding() {
    let invoker = Arc::new(FakeInvoker::new());
    let dir = tempdir().unwrap();
    let schema = json!({
        "type": "object",
        "required": ["param1"],
        "properties": { "param1": { "type": "string" } }
    });
    let schema_cache = Arc::new(SchemaCache::new(Arc::new(FixedSchemaProvider(schema)), None));
    let state = ProxyState {
        upstream_pool: invoker.clone(),
        allowlist: Arc::new(Allowlist::new(vec!["mcp__fs__read".to_string()])),
        schema_cache,
        rate_limiter: Arc::new(RateLimiter::new(30, Duration::from_secs(60))),
        audit: Arc::new(AuditLogger::new(dir.path().to_path_buf(), 30)),
        tracker: Arc::new(ToolCallTracker::new()),
        discovery_timeout: Duration::from_millis(500),
        auth_token: Arc::new("deadbeef".repeat(8)),
    };
    let token = (*state.auth_token).clone();
    let app = build_router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/")
        .header("authorization", bearer(&token))
        .header("content-type", "application/json")
        .body(Body::from(json!({"toolName": "mcp__fs__read", "params": {}}).to_string()))
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(invoker.calls.lock().unwrap().is_empty());

    let body = axum::body::to_bytes(resp.into_body(), 65536).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["error"].as_str().unwrap().contains("param1"));
}

#[tokio::test]
async fn missing_auth_header_returns_401() {
    let (state, _) = test_state(vec!["mcp__fs__read".to_string()]);
    let app = build_router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/")
        .header("content-type", "application/json")
        .body(Body::from(json!({"toolName": "mcp__fs__read", "params": {}}).to_string()))
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_token_returns_401() {
    let (state, _) = test_state(vec!["mcp__fs__read".to_string()]);
    let app = build_router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/")
        .header("authorization", bearer(&"wrong".repeat(16)))
        .header("content-type", "application/json")
        .body(Body::from(json!({"toolName": "mcp__fs__read", "params": {}}).to_string()))
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

/// A bad bearer token paired with a malformed body must still fail on auth
/// first: the body is never even looked at, so this isn't axum's 400/422
/// extractor rejection, it's the same 401 an empty body would get.
#[tokio::test]
async fn bad_auth_with_malformed_body_still_returns_401() {
    let (state, _) = test_state(vec!["mcp__fs__read".to_string()]);
    let app = build_router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/")
        .header("authorization", bearer(&"wrong".repeat(16)))
        .header("content-type", "application/json")
        .body(Body::from("not json at all"))
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

/// With a valid token, a malformed body (or one missing `toolName`) is
/// `InvalidInput` -> `400 {error}`, never axum's extractor rejection.
#[tokio::test]
async fn good_auth_with_malformed_body_returns_400() {
    let (state, _) = test_state(vec!["mcp__fs__read".to_string()]);
    let token = (*state.auth_token).clone();
    let app = build_router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/")
        .header("authorization", bearer(&token))
        .header("content-type", "application/json")
        .body(Body::from(json!({"params": {}}).to_string()))
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body = axum::body::to_bytes(resp.into_body(), 65536).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn tool_not_in_allowlist_returns_403() {
    let (state, invoker) = test_state(vec![]);
    let token = (*state.auth_token).clone();
    let app = build_router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/")
        .header("authorization", bearer(&token))
        .header("content-type", "application/json")
        .body(Body::from(json!({"toolName": "mcp__evil__forbidden", "params": {}}).to_string()))
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(invoker.calls.lock().unwrap().is_empty());

    let body = axum::body::to_bytes(resp.into_body(), 65536).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "Tool 'mcp__evil__forbidden' not in allowlist");
}

#[tokio::test]
async fn allowed_tool_forwards_and_returns_200() {
    let (state, invoker) = test_state(vec!["mcp__fs__read".to_string()]);
    let token = (*state.auth_token).clone();
    let app = build_router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/")
        .header("authorization", bearer(&token))
        .header("content-type", "application/json")
        .body(Body::from(json!({"toolName": "mcp__fs__read", "params": {"path": "/tmp"}}).to_string()))
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(invoker.calls.lock().unwrap().as_slice(), ["mcp__fs__read"]);
}

#[tokio::test]
async fn upstream_failure_returns_500_and_tracks_error() {
    let (state, invoker) = test_state(vec!["mcp__fs__read".to_string()]);
    *invoker.response.lock().unwrap() = Err("boom".to_string());
    let token = (*state.auth_token).clone();
    let tracker = state.tracker.clone();
    let app = build_router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/")
        .header("authorization", bearer(&token))
        .header("content-type", "application/json")
        .body(Body::from(json!({"toolName": "mcp__fs__read", "params": {"path": "/tmp"}}).to_string()))
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let calls = tracker.get_calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].status, CallStatus::Error);
}

#[tokio::test]
async fn discovery_returns_all_tools_without_query() {
    let (state, _) = test_state(vec![]);
    let token = (*state.auth_token).clone();
    let app = build_router(state);

    let req = Request::builder()
        .method("GET")
        .uri("/mcp/tools")
        .header("authorization", bearer(&token))
        .body(Body::empty())
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), 65536).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["tools"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn discovery_filters_by_query_substring() {
    let (state, _) = test_state(vec![]);
    let token = (*state.auth_token).clone();
    let app = build_router(state);

    let req = Request::builder()
        .method("GET")
        .uri("/mcp/tools?q=nonexistent_keyword")
        .header("authorization", bearer(&token))
        .body(Body::empty())
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), 65536).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["tools"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn discovery_rejects_bad_query_characters() {
    let (state, _) = test_state(vec![]);
    let token = (*state.auth_token).clone();
    let app = build_router(state);

    let req = Request::builder()
        .method("GET")
        .uri("/mcp/tools?q=bad%3Bchar")
        .header("authorization", bearer(&token))
        .body(Body::empty())
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn discovery_bypasses_allowlist() {
    // The allowlist is empty, but discovery still returns the tool's
    // metadata — only POST / is gated.
    let (state, _) = test_state(vec![]);
    let token = (*state.auth_token).clone();
    let app = build_router(state);

    let req = Request::builder()
        .method("GET")
        .uri("/mcp/tools")
        .header("authorization", bearer(&token))
        .body(Body::empty())
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn discovery_rate_limit_exceeded_reports_window_seconds() {
    let (mut state, _) = test_state(vec![]);
    state.rate_limiter = Arc::new(RateLimiter::new(1, Duration::from_secs(60)));
    let token = (*state.auth_token).clone();
    let app = build_router(state);

    let make_req = || {
        Request::builder()
            .method("GET")
            .uri("/mcp/tools")
            .header("authorization", bearer(&token))
            .body(Body::empty())
            .unwrap()
    };

    let first = app.clone().oneshot(make_req()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(make_req()).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = axum::body::to_bytes(second.into_body(), 65536).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["window"], 60);
    assert_eq!(json["limit"], 1);
}

#[tokio::test]
async fn unknown_route_returns_404_with_route_list() {
    let (state, _) = test_state(vec![]);
    let app = build_router(state);

    let req = Request::builder()
        .method("GET")
        .uri("/nonexistent")
        .body(Body::empty())
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn full_lifecycle_start_and_stop() {
    let invoker: Arc<dyn ToolInvoker> = Arc::new(FakeInvoker::new());
    let dir = tempdir().unwrap();
    let mut proxy = ProxyServer::new(ProxyConstructParams {
        upstream_pool: invoker,
        allowlist: Allowlist::new(vec!["mcp__fs__read".to_string()]),
        schema_cache: Arc::new(SchemaCache::new(Arc::new(NoopProvider), None)),
        rate_limiter: RateLimiter::new(30, Duration::from_secs(60)),
        audit: Arc::new(AuditLogger::new(dir.path().to_path_buf(), 30)),
        discovery_timeout: Duration::from_millis(500),
    });

    let started = proxy.start().await.unwrap();
    assert_ne!(started.port, 0);
    assert_eq!(started.auth_token.len(), 64);

    proxy.stop().await;
}
