/// Security alert persistence
///
/// Alerts are inserted by the anomaly detector and only ever move forward
/// through their status lifecycle. Status updates are compare-and-set on the
/// previous status so two concurrent updates cannot both succeed.
use anyhow::{anyhow, Context, Result};
use sdk::{AlertStatus, AlertType, Severity};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;

use super::{like_pattern, Pagination, SortDirection, SEVERITY_RANK_SQL};

/// Stored alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub plugin_id: Option<String>,
    pub user_id: Option<String>,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub status: AlertStatus,
    pub alert_data: serde_json::Value,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<i64>,
    pub resolved_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Filters for alert queries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertFilter {
    pub status: Option<AlertStatus>,
    pub severity: Option<Severity>,
    pub alert_type: Option<AlertType>,
    pub plugin_id: Option<String>,
    /// Case-insensitive substring of title, description or plugin id
    pub search: Option<String>,
}

/// Sortable alert columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSortField {
    #[default]
    CreatedAt,
    Severity,
    Status,
}

impl AlertSortField {
    fn sql(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::Severity => SEVERITY_RANK_SQL,
            Self::Status => "status",
        }
    }
}

impl FromStr for AlertSortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" | "createdAt" => Ok(Self::CreatedAt),
            "severity" => Ok(Self::Severity),
            "status" => Ok(Self::Status),
            other => Err(format!("unknown alert sort field '{}'", other)),
        }
    }
}

/// Aggregate counts over every stored alert
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertStats {
    pub total: i64,
    pub open: i64,
    pub acknowledged: i64,
    pub resolved: i64,
    pub dismissed: i64,
    pub by_severity: BTreeMap<Severity, i64>,
}

const ALERT_COLUMNS: &str = "id, plugin_id, user_id, alert_type, severity, title, description, \
    status, alert_data, acknowledged_by, acknowledged_at, resolved_at, created_at, updated_at";

fn record_from_row(r: &SqliteRow) -> Result<AlertRecord> {
    let alert_type: String = r.get("alert_type");
    let severity: String = r.get("severity");
    let status: String = r.get("status");
    let alert_data: String = r.get("alert_data");

    Ok(AlertRecord {
        id: r.get("id"),
        plugin_id: r.get("plugin_id"),
        user_id: r.get("user_id"),
        alert_type: alert_type.parse().map_err(|e| anyhow!("{}", e))?,
        severity: severity.parse().map_err(|e| anyhow!("{}", e))?,
        title: r.get("title"),
        description: r.get("description"),
        status: status.parse().map_err(|e| anyhow!("{}", e))?,
        alert_data: serde_json::from_str(&alert_data).context("Corrupt alert_data")?,
        acknowledged_by: r.get("acknowledged_by"),
        acknowledged_at: r.get("acknowledged_at"),
        resolved_at: r.get("resolved_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &AlertFilter) {
    qb.push(" WHERE 1 = 1");

    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(severity) = filter.severity {
        qb.push(" AND severity = ").push_bind(severity.as_str());
    }
    if let Some(alert_type) = filter.alert_type {
        qb.push(" AND alert_type = ").push_bind(alert_type.as_str());
    }
    if let Some(plugin_id) = &filter.plugin_id {
        qb.push(" AND plugin_id = ").push_bind(plugin_id.clone());
    }
    if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let pattern = like_pattern(search.trim());
        qb.push(" AND (LOWER(title) LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR LOWER(description) LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR LOWER(COALESCE(plugin_id, '')) LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
}

/// Alert repository for database operations
#[derive(Clone)]
pub struct AlertRepository {
    pool: SqlitePool,
}

impl AlertRepository {
    /// Create a new alert repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new alert
    pub async fn insert(&self, record: &AlertRecord) -> Result<()> {
        let alert_data = serde_json::to_string(&record.alert_data)?;

        sqlx::query(&format!(
            "INSERT INTO security_alerts ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            ALERT_COLUMNS
        ))
        .bind(&record.id)
        .bind(&record.plugin_id)
        .bind(&record.user_id)
        .bind(record.alert_type.as_str())
        .bind(record.severity.as_str())
        .bind(&record.title)
        .bind(&record.description)
        .bind(record.status.as_str())
        .bind(alert_data)
        .bind(&record.acknowledged_by)
        .bind(record.acknowledged_at)
        .bind(record.resolved_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert alert")?;

        Ok(())
    }

    /// Get an alert by id
    pub async fn get(&self, id: &str) -> Result<Option<AlertRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM security_alerts WHERE id = ?",
            ALERT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch alert")?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Newest open or acknowledged alert for (plugin, type) created at or
    /// after `since`
    pub async fn find_active(
        &self,
        plugin_id: Option<&str>,
        alert_type: AlertType,
        since: i64,
    ) -> Result<Option<AlertRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM security_alerts
             WHERE alert_type = ? AND plugin_id IS ? AND status IN ('open', 'acknowledged')
               AND created_at >= ?
             ORDER BY created_at DESC LIMIT 1",
            ALERT_COLUMNS
        ))
        .bind(alert_type.as_str())
        .bind(plugin_id)
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up active alert")?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Move an alert from `from` to `to`
    ///
    /// Returns `false` when the alert was no longer in `from`.
    pub async fn transition(
        &self,
        id: &str,
        from: AlertStatus,
        to: AlertStatus,
        actor: Option<&str>,
        now: i64,
    ) -> Result<bool> {
        let acknowledged = to == AlertStatus::Acknowledged;
        let resolved = to == AlertStatus::Resolved;

        let result = sqlx::query(
            "UPDATE security_alerts SET
                status = ?,
                updated_at = ?,
                acknowledged_by = CASE WHEN ? THEN ? ELSE acknowledged_by END,
                acknowledged_at = CASE WHEN ? THEN ? ELSE acknowledged_at END,
                resolved_at = CASE WHEN ? THEN ? ELSE resolved_at END
             WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(now)
        .bind(acknowledged)
        .bind(actor)
        .bind(acknowledged)
        .bind(now)
        .bind(resolved)
        .bind(now)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to update alert status")?;

        Ok(result.rows_affected() == 1)
    }

    /// Filtered, sorted page of alerts plus the total size of the filtered set
    pub async fn query(
        &self,
        filter: &AlertFilter,
        pagination: Pagination,
        sort: AlertSortField,
        direction: SortDirection,
    ) -> Result<(Vec<AlertRecord>, i64)> {
        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM security_alerts");
        push_filters(&mut count_qb, filter);
        let total: i64 = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .context("Failed to count alerts")?;

        let mut qb =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM security_alerts", ALERT_COLUMNS));
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
            .context("Failed to query alerts")?;

        let alerts = rows.iter().map(record_from_row).collect::<Result<Vec<_>>>()?;
        Ok((alerts, total))
    }

    /// Status and severity counts over all alerts
    pub async fn stats(&self) -> Result<AlertStats> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT status, severity, COUNT(*) FROM security_alerts GROUP BY status, severity",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to compute alert stats")?;

        let mut stats = AlertStats::default();
        for (status, severity, count) in rows {
            stats.total += count;

            match status.parse::<AlertStatus>() {
                Ok(AlertStatus::Open) => stats.open += count,
                Ok(AlertStatus::Acknowledged) => stats.acknowledged += count,
                Ok(AlertStatus::Resolved) => stats.resolved += count,
                Ok(AlertStatus::Dismissed) => stats.dismissed += count,
                Err(e) => tracing::warn!("Skipping alert with {}", e),
            }

            if let Ok(severity) = severity.parse::<Severity>() {
                *stats.by_severity.entry(severity).or_insert(0) += count;
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;
    use tempfile::TempDir;

    fn alert(plugin_id: &str, alert_type: AlertType, severity: Severity, at: i64) -> AlertRecord {
        AlertRecord {
            id: uuid::Uuid::new_v4().to_string(),
            plugin_id: Some(plugin_id.to_string()),
            user_id: None,
            alert_type,
            severity,
            title: format!("{} for {}", alert_type, plugin_id),
            description: "test".to_string(),
            status: AlertStatus::Open,
            alert_data: json!({}),
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_at: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn test_find_active_respects_window_and_status() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let repo = db.alerts();

        let a = alert("com.example.a", AlertType::RateLimitSpike, Severity::High, 1_000);
        repo.insert(&a).await.unwrap();

        let found = repo
            .find_active(Some("com.example.a"), AlertType::RateLimitSpike, 500)
            .await
            .unwrap();
        assert_eq!(found.map(|r| r.id), Some(a.id.clone()));

        let outside_window = repo
            .find_active(Some("com.example.a"), AlertType::RateLimitSpike, 2_000)
            .await
            .unwrap();
        assert!(outside_window.is_none());

        assert!(repo
            .transition(&a.id, AlertStatus::Open, AlertStatus::Dismissed, None, 1_500)
            .await
            .unwrap());
        let dismissed = repo
            .find_active(Some("com.example.a"), AlertType::RateLimitSpike, 500)
            .await
            .unwrap();
        assert!(dismissed.is_none());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let repo = db.alerts();

        let a = alert("com.example.a", AlertType::PluginErrorSpike, Severity::High, 1_000);
        repo.insert(&a).await.unwrap();

        assert!(repo
            .transition(&a.id, AlertStatus::Open, AlertStatus::Acknowledged, Some("ops"), 2_000)
            .await
            .unwrap());
        // Stale `from` no longer matches
        assert!(!repo
            .transition(&a.id, AlertStatus::Open, AlertStatus::Resolved, None, 3_000)
            .await
            .unwrap());

        let stored = repo.get(&a.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertStatus::Acknowledged);
        assert_eq!(stored.acknowledged_by.as_deref(), Some("ops"));
        assert_eq!(stored.acknowledged_at, Some(2_000));
        assert_eq!(stored.updated_at, 2_000);
        assert_eq!(stored.resolved_at, None);
    }

    #[tokio::test]
    async fn test_stats_and_search() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let repo = db.alerts();

        repo.insert(&alert("com.example.a", AlertType::RateLimitSpike, Severity::High, 1))
            .await
            .unwrap();
        repo.insert(&alert("com.example.b", AlertType::ApiCallAnomaly, Severity::Medium, 2))
            .await
            .unwrap();

        let stats = repo.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.open, 2);
        assert_eq!(stats.by_severity.get(&Severity::High), Some(&1));

        let filter = AlertFilter {
            search: Some("EXAMPLE.B".into()),
            ..Default::default()
        };
        let (alerts, total) = repo
            .query(&filter, Pagination::default(), AlertSortField::CreatedAt, SortDirection::Desc)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(alerts[0].alert_type, AlertType::ApiCallAnomaly);
    }
}
