//! Security audit logger
//!
//! Append-only sink for runtime security events. `record` never blocks and
//! never fails the caller: entries go onto a bounded channel drained by a
//! single writer task, and anything that cannot be queued or written is
//! reported with `tracing::warn!` and dropped.
//!
//! # Example
//!
//! ```no_run
//! # async fn example(db: warden_engine::db::Database) {
//! use warden_engine::audit::AuditLogger;
//!
//! let audit = AuditLogger::new(db.audit());
//! audit.log_api_call("com.example.hello", None, "editor", true, 12, None);
//! audit.flush().await;
//! # }
//! ```

use crate::db::{
    now_millis, AuditFilter, AuditRecord, AuditRepository, AuditSortField, Pagination,
    SortDirection,
};
use sdk::errors::EngineError;
use sdk::{AuditEventType, Capability, Severity};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Capacity of the queue between `record` and the writer task
pub const AUDIT_BUFFER_SIZE: usize = 1024;

/// Minimum spacing of rate-limit violation entries per plugin
const RATE_LIMIT_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// An event waiting to be recorded
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub plugin_id: String,
    pub user_id: Option<String>,
    pub event_type: AuditEventType,
    pub severity: Severity,
    pub event_data: serde_json::Value,
}

impl AuditEvent {
    /// Event with the type's default severity and no data
    pub fn new(plugin_id: impl Into<String>, event_type: AuditEventType) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            user_id: None,
            event_type,
            severity: event_type.default_severity(),
            event_data: serde_json::Value::Null,
        }
    }

    pub fn with_user(mut self, user_id: Option<&str>) -> Self {
        self.user_id = user_id.map(str::to_string);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_data(mut self, event_data: serde_json::Value) -> Self {
        self.event_data = event_data;
        self
    }
}

/// A page of audit entries
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditPage {
    pub entries: Vec<AuditRecord>,
    /// Size of the filtered set, ignoring pagination
    pub total_count: i64,
}

enum Command {
    Record(AuditRecord),
    Flush(oneshot::Sender<()>),
}

/// Handle to the audit writer
///
/// Cheap to clone; all clones feed the same writer task.
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::Sender<Command>,
    repo: AuditRepository,
    dropped: Arc<AtomicU64>,
    last_rate_limit_log: Arc<Mutex<HashMap<String, Instant>>>,
}

impl AuditLogger {
    /// Create a logger and spawn its writer task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(repo: AuditRepository) -> Self {
        let (tx, rx) = mpsc::channel(AUDIT_BUFFER_SIZE);
        let dropped = Arc::new(AtomicU64::new(0));

        tokio::spawn(run_writer(repo.clone(), rx, dropped.clone()));

        Self {
            tx,
            repo,
            dropped,
            last_rate_limit_log: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue one event; never blocks and never fails
    pub fn record(&self, event: AuditEvent) {
        let record = AuditRecord {
            id: uuid::Uuid::new_v4().to_string(),
            plugin_id: event.plugin_id,
            user_id: event.user_id,
            event_type: event.event_type,
            severity: event.severity,
            event_data: event.event_data,
            created_at: now_millis(),
        };

        if let Err(e) = self.tx.try_send(Command::Record(record)) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "writer stopped",
            };
            warn!("Dropping audit entry: {}", reason);
        }
    }

    /// Wait until every entry recorded before this call has been written
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).await.is_err() {
            warn!("Audit writer stopped before flush");
            return;
        }
        let _ = ack_rx.await;
    }

    /// Entries that could not be queued or written since startup
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Filtered, sorted page of entries
    pub async fn query(
        &self,
        filter: &AuditFilter,
        pagination: Pagination,
        sort: AuditSortField,
        direction: SortDirection,
    ) -> Result<AuditPage, EngineError> {
        let (entries, total_count) = self
            .repo
            .query(filter, pagination, sort, direction)
            .await
            .map_err(|e| EngineError::Storage(format!("{:#}", e)))?;

        Ok(AuditPage {
            entries,
            total_count,
        })
    }

    pub fn log_api_call(
        &self,
        plugin_id: &str,
        user_id: Option<&str>,
        method: &str,
        success: bool,
        duration_ms: u64,
        error: Option<&str>,
    ) {
        let event_type = if success {
            AuditEventType::ApiCall
        } else {
            AuditEventType::ApiCallFailed
        };

        self.record(
            AuditEvent::new(plugin_id, event_type)
                .with_user(user_id)
                .with_data(json!({
                    "method": method,
                    "success": success,
                    "durationMs": duration_ms,
                    "error": error,
                })),
        );
    }

    /// Record a rate-limit violation, at most once per plugin per second
    pub fn log_rate_limit_violation(
        &self,
        plugin_id: &str,
        user_id: Option<&str>,
        method: &str,
        reason: &str,
        retry_after_ms: Option<u64>,
    ) {
        if !self.should_log_rate_limit(plugin_id) {
            debug!("Throttled rate limit audit entry for {}", plugin_id);
            return;
        }

        self.record(
            AuditEvent::new(plugin_id, AuditEventType::RateLimitViolation)
                .with_user(user_id)
                .with_data(json!({
                    "method": method,
                    "reason": reason,
                    "retryAfterMs": retry_after_ms,
                })),
        );
    }

    fn should_log_rate_limit(&self, plugin_id: &str) -> bool {
        let now = Instant::now();
        let mut last = match self.last_rate_limit_log.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match last.get(plugin_id) {
            Some(prev) if now.duration_since(*prev) < RATE_LIMIT_LOG_INTERVAL => false,
            _ => {
                last.insert(plugin_id.to_string(), now);
                true
            }
        }
    }

    pub fn log_execution_timeout(
        &self,
        plugin_id: &str,
        user_id: Option<&str>,
        method: &str,
        limit_ms: u64,
    ) {
        self.record(
            AuditEvent::new(plugin_id, AuditEventType::ExecutionTimeout)
                .with_user(user_id)
                .with_data(json!({ "method": method, "limitMs": limit_ms })),
        );
    }

    /// Record a storage operation; over-quota operations are recorded as
    /// `storage_quota_exceeded` instead
    pub fn log_storage_access(
        &self,
        plugin_id: &str,
        user_id: Option<&str>,
        operation: &str,
        bytes: u64,
        max_bytes: Option<u64>,
    ) {
        let exceeded = max_bytes.is_some_and(|max| bytes > max);
        let event_type = if exceeded {
            AuditEventType::StorageQuotaExceeded
        } else {
            AuditEventType::StorageAccess
        };

        self.record(
            AuditEvent::new(plugin_id, event_type)
                .with_user(user_id)
                .with_data(json!({
                    "operation": operation,
                    "bytes": bytes,
                    "maxBytes": max_bytes,
                })),
        );
    }

    pub fn log_plugin_error(
        &self,
        plugin_id: &str,
        user_id: Option<&str>,
        message: &str,
        severity: Severity,
    ) {
        self.record(
            AuditEvent::new(plugin_id, AuditEventType::PluginError)
                .with_user(user_id)
                .with_severity(severity)
                .with_data(json!({ "message": message })),
        );
    }

    pub fn log_plugin_terminated(
        &self,
        plugin_id: &str,
        user_id: Option<&str>,
        reason: &str,
        severity: Severity,
    ) {
        self.record(
            AuditEvent::new(plugin_id, AuditEventType::PluginTerminated)
                .with_user(user_id)
                .with_severity(severity)
                .with_data(json!({ "reason": reason })),
        );
    }

    pub fn log_unauthorized_access(
        &self,
        plugin_id: &str,
        user_id: Option<&str>,
        capability: Capability,
    ) {
        self.record(
            AuditEvent::new(plugin_id, AuditEventType::UnauthorizedAccessAttempt)
                .with_user(user_id)
                .with_data(json!({ "capability": capability.as_str() })),
        );
    }
}

async fn run_writer(
    repo: AuditRepository,
    mut rx: mpsc::Receiver<Command>,
    dropped: Arc<AtomicU64>,
) {
    debug!("Audit writer started");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(record) => {
                if let Err(e) = repo.insert(&record).await {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Failed to write audit entry {} for {}: {:#}",
                        record.event_type, record.plugin_id, e
                    );
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    debug!("Audit writer stopped");
}
