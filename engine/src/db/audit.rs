/// Security audit log persistence
///
/// Rows are inserted by the audit writer task and never updated or deleted.
/// List queries are assembled with `QueryBuilder` so every user-supplied
/// value is bound; only whitelisted column names are spliced into SQL.
use anyhow::{anyhow, Context, Result};
use sdk::{AuditEventType, Severity};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;

use super::{like_pattern, Pagination, SortDirection, SEVERITY_RANK_SQL};

/// One immutable audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub plugin_id: String,
    pub user_id: Option<String>,
    pub event_type: AuditEventType,
    pub severity: Severity,
    pub event_data: serde_json::Value,
    pub created_at: i64,
}

/// Filters for audit queries; `None` fields match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    pub plugin_id: Option<String>,
    pub user_id: Option<String>,
    pub event_type: Option<AuditEventType>,
    pub severity: Option<Severity>,
    /// Case-insensitive substring of plugin id or event type
    pub search: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
}

/// Sortable audit columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSortField {
    #[default]
    CreatedAt,
    Severity,
    EventType,
    PluginId,
}

impl AuditSortField {
    fn sql(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::Severity => SEVERITY_RANK_SQL,
            Self::EventType => "event_type",
            Self::PluginId => "plugin_id",
        }
    }
}

impl FromStr for AuditSortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" | "createdAt" => Ok(Self::CreatedAt),
            "severity" => Ok(Self::Severity),
            "event_type" | "eventType" => Ok(Self::EventType),
            "plugin_id" | "pluginId" => Ok(Self::PluginId),
            other => Err(format!("unknown audit sort field '{}'", other)),
        }
    }
}

const AUDIT_COLUMNS: &str =
    "id, plugin_id, user_id, event_type, severity, event_data, created_at";

fn record_from_row(r: &SqliteRow) -> Result<AuditRecord> {
    let event_type: String = r.get("event_type");
    let severity: String = r.get("severity");
    let event_data: String = r.get("event_data");

    Ok(AuditRecord {
        id: r.get("id"),
        plugin_id: r.get("plugin_id"),
        user_id: r.get("user_id"),
        event_type: event_type.parse().map_err(|e| anyhow!("{}", e))?,
        severity: severity.parse().map_err(|e| anyhow!("{}", e))?,
        event_data: serde_json::from_str(&event_data).context("Corrupt audit event_data")?,
        created_at: r.get("created_at"),
    })
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &AuditFilter) {
    qb.push(" WHERE 1 = 1");

    if let Some(plugin_id) = &filter.plugin_id {
        qb.push(" AND plugin_id = ").push_bind(plugin_id.clone());
    }
    if let Some(user_id) = &filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id.clone());
    }
    if let Some(event_type) = filter.event_type {
        qb.push(" AND event_type = ").push_bind(event_type.as_str());
    }
    if let Some(severity) = filter.severity {
        qb.push(" AND severity = ").push_bind(severity.as_str());
    }
    if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let pattern = like_pattern(search.trim());
        qb.push(" AND (LOWER(plugin_id) LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR LOWER(event_type) LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
    if let Some(since) = filter.since {
        qb.push(" AND created_at >= ").push_bind(since);
    }
    if let Some(until) = filter.until {
        qb.push(" AND created_at <= ").push_bind(until);
    }
}

/// Audit repository for database operations
#[derive(Clone)]
pub struct AuditRepository {
    pool: SqlitePool,
}

impl AuditRepository {
    /// Create a new audit repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one entry
    pub async fn insert(&self, record: &AuditRecord) -> Result<()> {
        let event_data = serde_json::to_string(&record.event_data)?;

        sqlx::query(
            "INSERT INTO security_audit_logs (id, plugin_id, user_id, event_type, severity, event_data, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.plugin_id)
        .bind(&record.user_id)
        .bind(record.event_type.as_str())
        .bind(record.severity.as_str())
        .bind(event_data)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert audit entry")?;

        Ok(())
    }

    /// Filtered, sorted page of entries plus the total size of the filtered set
    pub async fn query(
        &self,
        filter: &AuditFilter,
        pagination: Pagination,
        sort: AuditSortField,
        direction: SortDirection,
    ) -> Result<(Vec<AuditRecord>, i64)> {
        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM security_audit_logs");
        push_filters(&mut count_qb, filter);
        let total: i64 = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .context("Failed to count audit entries")?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM security_audit_logs",
            AUDIT_COLUMNS
        ));
        push_filters(&mut qb, filter);
        qb.push(format!(
            " ORDER BY {} {}, created_at {}, rowid {}",
            sort.sql(),
            direction.sql(),
            direction.sql(),
            direction.sql()
        ));
        qb.push(" LIMIT ")
            .push_bind(pagination.effective_limit())
            .push(" OFFSET ")
            .push_bind(pagination.offset());

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to query audit entries")?;

        let entries = rows.iter().map(record_from_row).collect::<Result<Vec<_>>>()?;
        Ok((entries, total))
    }

    /// Count entries per plugin for the given event types since `since`
    ///
    /// Entries below `min_severity` are ignored when it is set.
    pub async fn count_by_plugin(
        &self,
        event_types: &[AuditEventType],
        min_severity: Option<Severity>,
        since: i64,
    ) -> Result<Vec<(String, i64)>> {
        if event_types.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT plugin_id, COUNT(*) FROM security_audit_logs WHERE created_at >= ",
        );
        qb.push_bind(since);

        qb.push(" AND event_type IN (");
        let mut types = qb.separated(", ");
        for event_type in event_types {
            types.push_bind(event_type.as_str());
        }
        types.push_unseparated(")");

        if let Some(min) = min_severity {
            qb.push(" AND severity IN (");
            let mut severities = qb.separated(", ");
            for severity in min.at_least() {
                severities.push_bind(severity.as_str());
            }
            severities.push_unseparated(")");
        }

        qb.push(" GROUP BY plugin_id");

        let rows: Vec<(String, i64)> = qb
            .build_query_as::<(String, i64)>()
            .fetch_all(&self.pool)
            .await
            .context("Failed to count audit entries by plugin")?;

        Ok(rows)
    }

    /// Critical entries per plugin since `since`, with the distinct event
    /// types involved
    pub async fn critical_by_plugin(&self, since: i64) -> Result<Vec<(String, i64, String)>> {
        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            "SELECT plugin_id, COUNT(*), GROUP_CONCAT(DISTINCT event_type)
             FROM security_audit_logs
             WHERE severity = 'critical' AND created_at >= ?
             GROUP BY plugin_id",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query critical audit entries")?;

        Ok(rows)
    }

    /// Total number of entries
    pub async fn count_all(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM security_audit_logs")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count audit entries")?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(
        plugin_id: &str,
        event_type: AuditEventType,
        severity: Severity,
        at: i64,
    ) -> AuditRecord {
        AuditRecord {
            id: uuid::Uuid::new_v4().to_string(),
            plugin_id: plugin_id.to_string(),
            user_id: None,
            event_type,
            severity,
            event_data: json!({ "at": at }),
            created_at: at,
        }
    }

    async fn seeded() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let repo = db.audit();

        let rows = [
            entry("com.example.a", AuditEventType::ApiCall, Severity::Low, 100),
            entry("com.example.a", AuditEventType::RateLimitViolation, Severity::High, 200),
            entry("com.example.b", AuditEventType::PluginError, Severity::Critical, 300),
            entry("com.example.b", AuditEventType::ApiCallFailed, Severity::Medium, 400),
        ];
        for row in &rows {
            repo.insert(row).await.unwrap();
        }

        (temp_dir, db)
    }

    #[tokio::test]
    async fn test_query_filters_and_total() {
        let (_dir, db) = seeded().await;
        let repo = db.audit();

        let filter = AuditFilter {
            plugin_id: Some("com.example.a".into()),
            ..Default::default()
        };
        let (entries, total) = repo
            .query(&filter, Pagination::new(1, 1), AuditSortField::CreatedAt, SortDirection::Desc)
            .await
            .unwrap();

        assert_eq!(total, 2);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, AuditEventType::RateLimitViolation);
    }

    #[tokio::test]
    async fn test_query_sorts_by_severity_rank() {
        let (_dir, db) = seeded().await;

        let (entries, _) = db
            .audit()
            .query(
                &AuditFilter::default(),
                Pagination::default(),
                AuditSortField::Severity,
                SortDirection::Desc,
            )
            .await
            .unwrap();

        let severities: Vec<_> = entries.iter().map(|e| e.severity).collect();
        assert_eq!(
            severities,
            vec![Severity::Critical, Severity::High, Severity::Medium, Severity::Low]
        );
    }

    #[tokio::test]
    async fn test_free_text_search_matches_event_type() {
        let (_dir, db) = seeded().await;

        let filter = AuditFilter {
            search: Some("API_CALL".into()),
            ..Default::default()
        };
        let (_, total) = db
            .audit()
            .query(&filter, Pagination::default(), AuditSortField::CreatedAt, SortDirection::Asc)
            .await
            .unwrap();

        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_count_by_plugin_respects_min_severity() {
        let (_dir, db) = seeded().await;
        let repo = db.audit();

        let counts = repo
            .count_by_plugin(
                &[AuditEventType::ApiCall, AuditEventType::ApiCallFailed],
                None,
                0,
            )
            .await
            .unwrap();
        assert_eq!(counts.len(), 2);

        let counts = repo
            .count_by_plugin(
                &[AuditEventType::ApiCall, AuditEventType::ApiCallFailed],
                Some(Severity::Medium),
                0,
            )
            .await
            .unwrap();
        assert_eq!(counts, vec![("com.example.b".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_critical_by_plugin() {
        let (_dir, db) = seeded().await;

        let rows = db.audit().critical_by_plugin(0).await.unwrap();
        assert_eq!(
            rows,
            vec![("com.example.b".to_string(), 1, "plugin_error".to_string())]
        );

        let rows = db.audit().critical_by_plugin(1_000).await.unwrap();
        assert!(rows.is_empty());
    }
}
