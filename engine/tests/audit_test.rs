//! Integration tests for the security audit logger

use sdk::{AuditEventType, Capability, Severity};
use serde_json::json;
use tempfile::TempDir;
use warden_engine::audit::{AuditEvent, AuditLogger, AUDIT_BUFFER_SIZE};
use warden_engine::db::{AuditFilter, AuditSortField, Database, Pagination, SortDirection};

async fn setup() -> (TempDir, AuditLogger) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
    (temp_dir, AuditLogger::new(db.audit()))
}

async fn query(
    audit: &AuditLogger,
    filter: AuditFilter,
    page: u32,
    limit: u32,
) -> (Vec<String>, i64) {
    let page = audit
        .query(
            &filter,
            Pagination::new(page, limit),
            AuditSortField::CreatedAt,
            SortDirection::Asc,
        )
        .await
        .unwrap();
    (
        page.entries.into_iter().map(|e| e.plugin_id).collect(),
        page.total_count,
    )
}

#[tokio::test]
async fn test_total_count_ignores_pagination() {
    let (_temp_dir, audit) = setup().await;
    for i in 0..25 {
        audit.log_api_call(&format!("com.example.p{}", i % 5), None, "ui", true, 3, None);
    }
    audit.flush().await;

    let (first, total) = query(&audit, AuditFilter::default(), 1, 10).await;
    assert_eq!(first.len(), 10);
    assert_eq!(total, 25);

    let (last, total) = query(&audit, AuditFilter::default(), 3, 10).await;
    assert_eq!(last.len(), 5);
    assert_eq!(total, 25);

    let (beyond, total) = query(&audit, AuditFilter::default(), 9, 10).await;
    assert!(beyond.is_empty());
    assert_eq!(total, 25);
}

#[tokio::test]
async fn test_filters_combine() {
    let (_temp_dir, audit) = setup().await;
    audit.log_api_call("com.example.a", Some("alice"), "ui", true, 1, None);
    audit.log_api_call("com.example.a", Some("bob"), "ui", false, 1, Some("boom"));
    audit.log_unauthorized_access("com.example.b", Some("alice"), Capability::Ai);
    audit.log_plugin_error("com.example.b", None, "disk on fire", Severity::Critical);
    audit.flush().await;

    let (entries, total) = query(
        &audit,
        AuditFilter {
            user_id: Some("alice".to_string()),
            ..Default::default()
        },
        1,
        50,
    )
    .await;
    assert_eq!(total, 2);
    assert_eq!(entries, vec!["com.example.a", "com.example.b"]);

    let (_, total) = query(
        &audit,
        AuditFilter {
            plugin_id: Some("com.example.a".to_string()),
            event_type: Some(AuditEventType::ApiCallFailed),
            ..Default::default()
        },
        1,
        50,
    )
    .await;
    assert_eq!(total, 1);

    let (entries, total) = query(
        &audit,
        AuditFilter {
            severity: Some(Severity::Critical),
            ..Default::default()
        },
        1,
        50,
    )
    .await;
    assert_eq!(total, 1);
    assert_eq!(entries, vec!["com.example.b"]);

    let (_, total) = query(
        &audit,
        AuditFilter {
            search: Some("EXAMPLE.B".to_string()),
            ..Default::default()
        },
        1,
        50,
    )
    .await;
    assert_eq!(total, 2);
}

#[tokio::test]
async fn test_default_and_explicit_severity() {
    let (_temp_dir, audit) = setup().await;
    audit.record(AuditEvent::new("com.example.a", AuditEventType::ExecutionTimeout));
    audit.record(
        AuditEvent::new("com.example.a", AuditEventType::ApiCall)
            .with_severity(Severity::Critical)
            .with_user(Some("carol"))
            .with_data(json!({ "note": "escalated" })),
    );
    audit.flush().await;

    let page = audit
        .query(
            &AuditFilter::default(),
            Pagination::default(),
            AuditSortField::CreatedAt,
            SortDirection::Asc,
        )
        .await
        .unwrap();

    assert_eq!(page.entries[0].severity, Severity::High);
    assert_eq!(page.entries[1].severity, Severity::Critical);
    assert_eq!(page.entries[1].user_id.as_deref(), Some("carol"));
    assert_eq!(page.entries[1].event_data["note"], "escalated");
}

#[tokio::test]
async fn test_rate_limit_entries_are_throttled() {
    let (_temp_dir, audit) = setup().await;
    for _ in 0..20 {
        audit.log_rate_limit_violation("com.example.a", None, "ui", "per-minute limit", Some(500));
    }
    audit.log_rate_limit_violation("com.example.b", None, "ui", "per-minute limit", None);
    audit.flush().await;

    let (_, total) = query(
        &audit,
        AuditFilter {
            event_type: Some(AuditEventType::RateLimitViolation),
            ..Default::default()
        },
        1,
        50,
    )
    .await;
    assert_eq!(total, 2);
}

#[tokio::test]
async fn test_storage_over_quota_is_recorded_as_exceeded() {
    let (_temp_dir, audit) = setup().await;
    audit.log_storage_access("com.example.a", None, "write", 50, Some(100));
    audit.log_storage_access("com.example.a", None, "write", 150, Some(100));
    audit.log_storage_access("com.example.a", None, "read", 10_000, None);
    audit.flush().await;

    let (_, exceeded) = query(
        &audit,
        AuditFilter {
            event_type: Some(AuditEventType::StorageQuotaExceeded),
            ..Default::default()
        },
        1,
        50,
    )
    .await;
    assert_eq!(exceeded, 1);
}

#[tokio::test]
async fn test_burst_within_buffer_is_not_dropped() {
    let (_temp_dir, audit) = setup().await;
    let burst = AUDIT_BUFFER_SIZE / 2;
    for _ in 0..burst {
        audit.record(AuditEvent::new("com.example.a", AuditEventType::ApiCall));
    }
    audit.flush().await;

    let (_, total) = query(&audit, AuditFilter::default(), 1, 1).await;
    assert_eq!(total, burst as i64);
    assert_eq!(audit.dropped_count(), 0);
}
