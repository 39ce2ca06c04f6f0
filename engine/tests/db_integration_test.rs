/// Integration tests for database module
///
/// Tests the complete database lifecycle including:
/// - Database creation and initialization
/// - WAL mode configuration
/// - Schema creation via migrations
/// - CHECK constraints on closed vocabularies
/// - Graceful shutdown with WAL flush
use sdk::{AlertStatus, AlertType, Severity};
use tempfile::TempDir;
use warden_engine::db::{AlertRecord, Database};

#[tokio::test]
async fn test_database_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("warden.db");

    let db = Database::new(&db_path).await.unwrap();

    assert!(db_path.exists());

    // Created when WAL mode is enabled
    let wal_path = temp_dir.path().join("warden.db-wal");
    assert!(wal_path.exists());

    let result = sqlx::query("SELECT COUNT(*) as count FROM security_audit_logs")
        .fetch_one(db.pool())
        .await;
    assert!(result.is_ok());

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_database_schema_complete() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("warden.db")).await.unwrap();

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(db.pool())
            .await
            .unwrap();

    for table in [
        "plugin_signatures",
        "signature_verifications",
        "security_audit_logs",
        "security_alerts",
    ] {
        assert!(tables.contains(&table.to_string()), "{} table missing", table);
    }

    let indexes: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%' ORDER BY name",
    )
    .fetch_all(db.pool())
    .await
    .unwrap();

    assert!(indexes.contains(&"idx_signature_verifications_plugin".to_string()));
    assert!(indexes.contains(&"idx_security_audit_logs_plugin_event".to_string()));
    assert!(indexes.contains(&"idx_security_alerts_dedupe".to_string()));

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("warden.db");

    let db = Database::new(&db_path).await.unwrap();
    sqlx::query(
        "INSERT INTO security_audit_logs (id, plugin_id, event_type, severity, created_at)
         VALUES ('a1', 'com.example.a', 'api_call', 'low', 1)",
    )
    .execute(db.pool())
    .await
    .unwrap();
    db.close().await.unwrap();

    let reopened = Database::new(&db_path).await.unwrap();
    assert_eq!(reopened.audit().count_all().await.unwrap(), 1);
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn test_severity_and_status_constraints() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("warden.db")).await.unwrap();

    let bad_severity = sqlx::query(
        "INSERT INTO security_audit_logs (id, plugin_id, event_type, severity, created_at)
         VALUES ('a1', 'com.example.a', 'api_call', 'apocalyptic', 1)",
    )
    .execute(db.pool())
    .await;
    assert!(bad_severity.is_err());

    let bad_status = sqlx::query(
        "INSERT INTO security_alerts
            (id, alert_type, severity, title, description, status, created_at, updated_at)
         VALUES ('x', 'rate_limit_spike', 'low', 't', 'd', 'snoozed', 1, 1)",
    )
    .execute(db.pool())
    .await;
    assert!(bad_status.is_err());

    let bad_result = sqlx::query(
        "INSERT INTO signature_verifications (id, plugin_id, result, verified_at)
         VALUES ('v', 'com.example.a', 'probably', 1)",
    )
    .execute(db.pool())
    .await;
    assert!(bad_result.is_err());

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_alert_transition_is_compare_and_set() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("warden.db")).await.unwrap();
    let alerts = db.alerts();

    alerts
        .insert(&AlertRecord {
            id: "alert-1".to_string(),
            plugin_id: Some("com.example.a".to_string()),
            user_id: None,
            alert_type: AlertType::PluginErrorSpike,
            severity: Severity::High,
            title: "Plugin error spike for com.example.a".to_string(),
            description: "12 plugin_error events".to_string(),
            status: AlertStatus::Open,
            alert_data: serde_json::json!({ "count": 12 }),
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_at: None,
            created_at: 1_000,
            updated_at: 1_000,
        })
        .await
        .unwrap();

    // Stale `from` loses
    let stale = alerts
        .transition("alert-1", AlertStatus::Acknowledged, AlertStatus::Resolved, None, 2_000)
        .await
        .unwrap();
    assert!(!stale);

    let moved = alerts
        .transition("alert-1", AlertStatus::Open, AlertStatus::Resolved, Some("ops"), 2_000)
        .await
        .unwrap();
    assert!(moved);

    let alert = alerts.get("alert-1").await.unwrap().unwrap();
    assert_eq!(alert.status, AlertStatus::Resolved);
    assert_eq!(alert.resolved_at, Some(2_000));
    assert_eq!(alert.updated_at, 2_000);
    assert_eq!(alert.alert_data["count"], 12);

    assert!(alerts
        .find_active(Some("com.example.a"), AlertType::PluginErrorSpike, 0)
        .await
        .unwrap()
        .is_none());

    db.close().await.unwrap();
}
