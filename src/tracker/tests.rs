use super::*;

fn record(tool: &str, duration_ms: u64, status: CallStatus) -> ToolCallRecord {
    ToolCallRecord {
        tool_name: tool.to_string(),
        duration_ms,
        status,
        error_message: if status == CallStatus::Error {
            Some("boom".to_string())
        } else {
            None
        },
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn empty_tracker_has_no_calls_or_summary() {
    let tracker = ToolCallTracker::new();
    assert!(tracker.get_calls().await.is_empty());
    assert!(tracker.get_unique_calls().await.is_empty());
    assert!(tracker.get_summary().await.is_empty());
}

#[tokio::test]
async fn aggregates_purely_from_append_log() {
    let tracker = ToolCallTracker::new();
    tracker
        .record(record("mcp__fs__read", 10, CallStatus::Success))
        .await;
    tracker
        .record(record("mcp__fs__read", 30, CallStatus::Success))
        .await;
    tracker
        .record(record("mcp__fs__read", 20, CallStatus::Error))
        .await;

    let summary = tracker.get_summary().await;
    assert_eq!(summary.len(), 1);
    let s = &summary[0];
    assert_eq!(s.call_count, 3);
    assert_eq!(s.success_count, 2);
    assert_eq!(s.error_count, 1);
    assert_eq!(s.total_duration_ms, 60);
    assert!((s.average_duration_ms - 20.0).abs() < f64::EPSILON);
    assert_eq!(s.last_call_duration_ms, 20);
    assert_eq!(s.last_call_status, CallStatus::Error);
    assert_eq!(s.last_error_message.as_deref(), Some("boom"));
}

#[tokio::test]
async fn unique_calls_preserve_first_seen_order() {
    let tracker = ToolCallTracker::new();
    tracker
        .record(record("mcp__b__x", 1, CallStatus::Success))
        .await;
    tracker
        .record(record("mcp__a__x", 1, CallStatus::Success))
        .await;
    tracker
        .record(record("mcp__b__x", 1, CallStatus::Success))
        .await;

    assert_eq!(
        tracker.get_unique_calls().await,
        vec!["mcp__b__x".to_string(), "mcp__a__x".to_string()]
    );
}

#[tokio::test]
async fn summaries_are_deep_copies() {
    let tracker = ToolCallTracker::new();
    tracker
        .record(record("mcp__fs__read", 10, CallStatus::Success))
        .await;

    let mut summary = tracker.get_summary().await;
    summary[0].call_count = 999;

    let fresh = tracker.get_summary().await;
    assert_eq!(fresh[0].call_count, 1);
}
