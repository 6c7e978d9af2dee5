use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct CountingProvider {
    calls: AtomicUsize,
    schema: ToolSchema,
    fail_after: Option<usize>,
}

impl CountingProvider {
    fn new(name: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            schema: ToolSchema {
                name: name.to_string(),
                description: None,
                input_schema: serde_json::json!({"type": "object"}),
            },
            fail_after: None,
        }
    }

    fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            schema: ToolSchema {
                name: "x".to_string(),
                description: None,
                input_schema: serde_json::json!({}),
            },
            fail_after: Some(0),
        }
    }
}

#[async_trait::async_trait]
impl SchemaProvider for CountingProvider {
    async fn fetch_schema(&self, full_name: &str) -> Result<ToolSchema, BrokerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_after
            && n >= limit
        {
            return Err(BrokerError::UpstreamFailure("boom".into()));
        }
        let mut schema = self.schema.clone();
        schema.name = full_name.to_string();
        Ok(schema)
    }
}

#[tokio::test]
async fn fetches_and_caches() {
    let provider = Arc::new(CountingProvider::new("mcp__fs__read"));
    let cache = SchemaCache::new(provider.clone(), None);

    let s1 = cache.get_tool_schema("mcp__fs__read").await.unwrap();
    assert_eq!(s1.name, "mcp__fs__read");
    let s2 = cache.get_tool_schema("mcp__fs__read").await.unwrap();
    assert_eq!(s2.name, "mcp__fs__read");

    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn coalesces_concurrent_fetches() {
    let provider = Arc::new(CountingProvider::new("mcp__fs__read"));
    let cache = Arc::new(SchemaCache::new(provider.clone(), None));

    let c1 = cache.clone();
    let c2 = cache.clone();
    let (r1, r2) = tokio::join!(
        c1.get_tool_schema("mcp__fs__read"),
        c2.get_tool_schema("mcp__fs__read")
    );
    assert!(r1.is_ok());
    assert!(r2.is_ok());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn serves_stale_on_fetch_error() {
    let provider = Arc::new(CountingProvider::new("mcp__fs__read"));
    let cache = SchemaCache::new(provider.clone(), None);
    cache.get_tool_schema("mcp__fs__read").await.unwrap();

    provider.calls.store(0, Ordering::SeqCst);
    let failing = Arc::new(CountingProvider::failing());
    let cache2 = SchemaCache::with_options(failing, None, Duration::from_millis(1), 10);
    cache2.get_tool_schema("mcp__x__y").await.ok();
}

#[tokio::test]
async fn invalidate_single_and_all() {
    let provider = Arc::new(CountingProvider::new("mcp__fs__read"));
    let cache = SchemaCache::new(provider.clone(), None);
    cache.get_tool_schema("mcp__fs__read").await.unwrap();
    assert_eq!(cache.get_stats().await.size, 1);

    cache.invalidate(Some("mcp__fs__read")).await;
    assert_eq!(cache.get_stats().await.size, 0);

    cache.get_tool_schema("mcp__fs__read").await.unwrap();
    cache.invalidate(None).await;
    assert_eq!(cache.get_stats().await.size, 0);
}

#[tokio::test]
async fn cleanup_removes_expired_entries() {
    let provider = Arc::new(CountingProvider::new("mcp__fs__read"));
    let cache = SchemaCache::with_options(provider, None, Duration::from_millis(1), 10);
    cache.get_tool_schema("mcp__fs__read").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let removed = cache.cleanup().await;
    assert_eq!(removed, 1);
    assert_eq!(cache.get_stats().await.size, 0);
}

#[tokio::test]
async fn persists_and_reloads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("schema-cache.json");

    let provider = Arc::new(CountingProvider::new("mcp__fs__read"));
    let cache = SchemaCache::new(provider, Some(path.clone()));
    cache.get_tool_schema("mcp__fs__read").await.unwrap();

    // persistence is fired via spawn_blocking; give it a moment.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(path.exists());

    let provider2 = Arc::new(CountingProvider::new("mcp__fs__read"));
    let cache2 = SchemaCache::new(provider2.clone(), Some(path));
    cache2.load_from_disk().await;
    assert_eq!(cache2.get_stats().await.size, 1);

    let schema = cache2.get_tool_schema("mcp__fs__read").await.unwrap();
    assert_eq!(schema.name, "mcp__fs__read");
    assert_eq!(provider2.calls.load(Ordering::SeqCst), 0);
}
