//! Per-execution tool-call tracker (spec.md §4.8).
//!
//! Append-only log of every call the proxy forwarded during one execution,
//! plus an aggregated per-tool summary derived purely from that log — no
//! hidden counters. Grounded on the append-then-aggregate shape the
//! teacher uses for daily cost aggregation (`agent/cost_guard/mod.rs`),
//! generalized from a daily bucket to a per-execution one.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub duration_ms: u64,
    pub status: CallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallSummary {
    pub tool_name: String,
    pub call_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
    pub last_call_duration_ms: u64,
    pub last_call_status: CallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    pub last_called_at: DateTime<Utc>,
}

/// In-memory log of calls proxied during one execution. Owned by the
/// execution's proxy instance; never shared across executions.
#[derive(Default)]
pub struct ToolCallTracker {
    calls: Mutex<Vec<ToolCallRecord>>,
}

impl ToolCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, record: ToolCallRecord) {
        self.calls.lock().await.push(record);
    }

    /// Deep copy of every call, in append order.
    pub async fn get_calls(&self) -> Vec<ToolCallRecord> {
        self.calls.lock().await.clone()
    }

    /// Unique tool names, in first-seen order.
    pub async fn get_unique_calls(&self) -> Vec<String> {
        let calls = self.calls.lock().await;
        let mut seen = Vec::new();
        for call in calls.iter() {
            if !seen.contains(&call.tool_name) {
                seen.push(call.tool_name.clone());
            }
        }
        seen
    }

    /// Aggregate per tool name, derived entirely from the append log.
    pub async fn get_summary(&self) -> Vec<ToolCallSummary> {
        let calls = self.calls.lock().await;
        let mut order: Vec<String> = Vec::new();
        let mut summaries: std::collections::HashMap<String, ToolCallSummary> =
            std::collections::HashMap::new();

        for call in calls.iter() {
            let entry = summaries
                .entry(call.tool_name.clone())
                .or_insert_with(|| {
                    order.push(call.tool_name.clone());
                    ToolCallSummary {
                        tool_name: call.tool_name.clone(),
                        call_count: 0,
                        success_count: 0,
                        error_count: 0,
                        total_duration_ms: 0,
                        average_duration_ms: 0.0,
                        last_call_duration_ms: 0,
                        last_call_status: call.status,
                        last_error_message: None,
                        last_called_at: call.timestamp,
                    }
                });

            entry.call_count += 1;
            entry.total_duration_ms += call.duration_ms;
            match call.status {
                CallStatus::Success => entry.success_count += 1,
                CallStatus::Error => entry.error_count += 1,
            }
            // Records are appended in call order, so the last one visited
            // for this tool is always the most recent.
            entry.last_call_duration_ms = call.duration_ms;
            entry.last_call_status = call.status;
            entry.last_error_message = call.error_message.clone();
            entry.last_called_at = call.timestamp;
            entry.average_duration_ms = entry.total_duration_ms as f64 / entry.call_count as f64;
        }

        order
            .into_iter()
            .filter_map(|name| summaries.remove(&name))
            .collect()
    }
}

#[cfg(test)]
mod tests;
