//! Append-only JSONL audit logger with daily UTC rotation and a retention
//! sweep (spec.md §4.9).
//!
//! Grounded on the teacher's `utils::atomic_write`/`ensure_dir` and its
//! `chrono`-based date handling (`session/manager.rs` uses
//! `chrono::Utc::now()` for per-session JSONL files the same way). Writes
//! are serialized through a `tokio::sync::Mutex` — the single-writer
//! pattern Design Notes §9 calls for — rather than buffered, since
//! `OpenOptions::append(true)` + `O_APPEND` is already atomic per line.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::warn;

use crate::errors::BrokerError;
use crate::utils::ensure_dir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AuthFailure,
    RateLimited,
    CircuitOpen,
    QueueFull,
    ToolCall,
    Shutdown,
    Discovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failure,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params_hash: Option<String>,
    pub status: AuditStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// SHA-256 hex digest, used for `clientId` and `paramsHash` so raw
/// identifiers/payloads never land in the log file.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

const DEFAULT_RETENTION_DAYS: u32 = 30;
const FILENAME_PREFIX: &str = "audit-";
const FILENAME_SUFFIX: &str = ".log";

struct State {
    /// Cached (date, path) so repeated `log()` calls on the same day don't
    /// recompute the filename. Invalidated by `rotate()` under the same
    /// lock `log()` uses, so an in-flight write can never land in a file
    /// pointer rotated out from under it mid-append.
    cached: Option<(NaiveDate, PathBuf)>,
}

pub struct AuditLogger {
    dir: PathBuf,
    retention_days: u32,
    state: Mutex<State>,
}

impl AuditLogger {
    pub fn new(dir: PathBuf, retention_days: u32) -> Self {
        Self {
            dir,
            retention_days,
            state: Mutex::new(State { cached: None }),
        }
    }

    /// Construct from the environment overrides spec.md §4.9 names:
    /// `HOME`/`USERPROFILE` for the state directory, and
    /// `AUDIT_LOG_RETENTION_DAYS` (integer, 1-365). Unparseable values fail
    /// fast rather than silently falling back to a default.
    pub fn from_env(broker_home: Option<PathBuf>) -> Result<Self, BrokerError> {
        let home = match broker_home {
            Some(h) => h,
            None => {
                let override_home = std::env::var_os("HOME")
                    .or_else(|| std::env::var_os("USERPROFILE"))
                    .map(PathBuf::from);
                match override_home {
                    Some(h) => h.join(".broker"),
                    None => {
                        return Err(BrokerError::InvalidInput(
                            "could not determine home directory for audit logs".to_string(),
                        ));
                    }
                }
            }
        };

        let retention_days = Self::retention_days_override(DEFAULT_RETENTION_DAYS)?;
        Ok(Self::new(home.join("audit"), retention_days))
    }

    /// Resolve `AUDIT_LOG_RETENTION_DAYS` (integer, 1-365) if set, falling
    /// back to `default` otherwise. Fails fast on an unparseable or
    /// out-of-range value rather than silently using the default, per
    /// spec.md §4.9's "strict environment override".
    pub fn retention_days_override(default: u32) -> Result<u32, BrokerError> {
        match std::env::var("AUDIT_LOG_RETENTION_DAYS") {
            Ok(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|d| (1..=365).contains(d))
                .ok_or_else(|| {
                    BrokerError::InvalidInput(format!(
                        "AUDIT_LOG_RETENTION_DAYS must be an integer in 1..=365, got '{raw}'"
                    ))
                }),
            Err(_) => Ok(default),
        }
    }

    fn filename_for(date: NaiveDate) -> String {
        format!("{FILENAME_PREFIX}{}{FILENAME_SUFFIX}", date.format("%Y-%m-%d"))
    }

    /// Append one entry as a single compact JSON line.
    pub async fn log(&self, entry: &AuditEntry) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let today = Utc::now().date_naive();

        let path = match &state.cached {
            Some((date, path)) if *date == today => path.clone(),
            _ => {
                ensure_dir(&self.dir)
                    .map_err(|e| BrokerError::Internal(e.context("creating audit log dir")))?;
                let path = self.dir.join(Self::filename_for(today));
                state.cached = Some((today, path.clone()));
                path
            }
        };

        let line = serde_json::to_string(entry)
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("serializing audit entry: {e}")))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                BrokerError::Internal(anyhow::anyhow!(
                    "opening audit log {}: {e}",
                    path.display()
                ))
            })?;
        writeln!(file, "{line}")
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("writing audit log: {e}")))?;
        Ok(())
    }

    /// Invalidate the cached filename pointer under the same lock `log()`
    /// uses, so the next append recomputes it.
    pub async fn rotate(&self) {
        let mut state = self.state.lock().await;
        state.cached = None;
    }

    /// No-op: `append(true)` + `O_APPEND` is already atomic per write.
    /// Kept for symmetry with a future buffered implementation.
    pub fn flush(&self) {}

    /// Delete every `audit-YYYY-MM-DD.log` file whose date is strictly
    /// older than `retentionDays` before today (inclusive boundary — see
    /// DESIGN.md Open Question (ii)). Returns the count removed.
    pub fn cleanup(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        let today = Utc::now().date_naive();
        let cutoff = today - chrono::Duration::days(self.retention_days as i64);

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(date) = parse_audit_filename(name) else {
                continue;
            };
            if date < cutoff && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            } else if date < cutoff {
                warn!("failed to remove expired audit log {}", path.display());
            }
        }
        removed
    }
}

fn parse_audit_filename(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_prefix(FILENAME_PREFIX)?.strip_suffix(FILENAME_SUFFIX)?;
    let parts: Vec<&str> = stem.split('-').collect();
    if parts.len() != 3 {
        return None;
    }
    let year: i32 = parts[0].parse().ok()?;
    let month: u32 = parts[1].parse().ok()?;
    let day: u32 = parts[2].parse().ok()?;
    if parts[0].len() != 4 || parts[1].len() != 2 || parts[2].len() != 2 {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Parse the newline-delimited JSONL file back into a list of raw JSON
/// values. Used by tests and by operators inspecting a day's log.
pub fn read_jsonl(path: &Path) -> Result<Vec<Value>, BrokerError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| BrokerError::Internal(anyhow::anyhow!("reading {}: {e}", path.display())))?;
    content
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| {
            serde_json::from_str(l)
                .map_err(|e| BrokerError::Internal(anyhow::anyhow!("parsing audit line: {e}")))
        })
        .collect()
}
