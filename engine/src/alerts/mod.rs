//! Anomaly detection and alerting
//!
//! A batch scan over audit and verification history. Each rule counts one
//! kind of event per plugin over a trailing window and raises an alert when
//! the count reaches the rule's threshold. Severity scales with how far the
//! count overshoots; duplicates of a still-active alert are suppressed.
//!
//! Detection never runs inline with event recording. It is triggered on
//! demand or by the loop in [`scheduler`].

use crate::config::{AlertRule, AlertsConfig, SeverityBand};
use crate::db::{
    now_millis, AlertFilter, AlertRecord, AlertRepository, AlertSortField, AlertStats,
    AuditRepository, Pagination, SignatureRepository, SortDirection,
};
use crate::message_bus::{Event, MessageBus};
use sdk::errors::EngineError;
use sdk::{AlertStatus, AlertType, AuditEventType, Severity};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod scheduler;

pub use scheduler::spawn_detection_loop;

/// Audit event types counted by each audit-backed rule
///
/// Signature failures come from the verification log and critical events
/// from severity, so both map to an empty slice.
pub fn source_events(alert_type: AlertType) -> &'static [AuditEventType] {
    match alert_type {
        AlertType::RateLimitSpike => &[AuditEventType::RateLimitViolation],
        AlertType::ExecutionTimeoutSpike => &[AuditEventType::ExecutionTimeout],
        AlertType::StorageQuotaSpike => &[AuditEventType::StorageQuotaExceeded],
        AlertType::UnauthorizedAccessSpike => &[AuditEventType::UnauthorizedAccessAttempt],
        AlertType::ApiCallAnomaly => &[AuditEventType::ApiCall, AuditEventType::ApiCallFailed],
        AlertType::PluginErrorSpike => &[AuditEventType::PluginError],
        AlertType::SignatureFailureSpike | AlertType::CriticalSeverityEvent => &[],
    }
}

/// Base severity raised by the highest band whose ratio the count reaches
pub fn scaled_severity(
    base: Severity,
    count: u64,
    threshold: u64,
    bands: &[SeverityBand],
) -> Severity {
    let ratio = count as f64 / threshold.max(1) as f64;

    let levels = bands
        .iter()
        .filter(|band| ratio >= band.min_ratio)
        .max_by(|a, b| a.min_ratio.total_cmp(&b.min_ratio))
        .map(|band| band.escalate)
        .unwrap_or(0);

    base.escalate(levels)
}

fn describe_window(secs: u64) -> String {
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{} h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{} min", secs / 60)
    } else {
        format!("{} s", secs)
    }
}

fn title_for(alert_type: AlertType, plugin_id: &str) -> String {
    let what = match alert_type {
        AlertType::RateLimitSpike => "Rate limit spike",
        AlertType::SignatureFailureSpike => "Signature verification failures",
        AlertType::ExecutionTimeoutSpike => "Execution timeout spike",
        AlertType::StorageQuotaSpike => "Storage quota spike",
        AlertType::UnauthorizedAccessSpike => "Unauthorized access attempts",
        AlertType::ApiCallAnomaly => "Abnormal API call volume",
        AlertType::PluginErrorSpike => "Plugin error spike",
        AlertType::CriticalSeverityEvent => "Critical security event",
    };
    format!("{} for {}", what, plugin_id)
}

/// A rule hit before dedupe
#[derive(Debug, Clone)]
struct Candidate {
    plugin_id: String,
    alert_type: AlertType,
    count: u64,
    /// Distinct event types, for critical events
    detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionReport {
    pub success: bool,
    pub alerts_created: Vec<AlertRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<AlertRecord>,
}

impl StatusUpdate {
    fn rejected(error: EngineError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            alert: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPage {
    pub alerts: Vec<AlertRecord>,
    pub total_count: i64,
    pub stats: AlertStats,
}

/// Scans history, raises deduplicated alerts and manages their status
pub struct AnomalyDetector {
    audit: AuditRepository,
    signatures: SignatureRepository,
    alerts: AlertRepository,
    config: AlertsConfig,
    bus: Option<Arc<MessageBus>>,
}

impl AnomalyDetector {
    pub fn new(
        audit: AuditRepository,
        signatures: SignatureRepository,
        alerts: AlertRepository,
        config: AlertsConfig,
    ) -> Self {
        Self {
            audit,
            signatures,
            alerts,
            config,
            bus: None,
        }
    }

    pub fn with_message_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &AlertsConfig {
        &self.config
    }

    pub async fn run_anomaly_detection(&self) -> DetectionReport {
        self.run_anomaly_detection_at(now_millis()).await
    }

    /// Run every enabled rule as of `now` (epoch millis)
    pub async fn run_anomaly_detection_at(&self, now: i64) -> DetectionReport {
        if let Err(e) = self.audit.count_all().await {
            warn!("Anomaly detection could not reach storage: {:#}", e);
            return DetectionReport {
                success: false,
                alerts_created: Vec::new(),
                error: Some(EngineError::Storage(format!("{:#}", e)).to_string()),
            };
        }

        let mut candidates = Vec::new();
        for alert_type in AlertType::ALL {
            let rule = self.config.rules.get(alert_type);
            if !rule.enabled {
                continue;
            }
            match self.evaluate(alert_type, rule, now).await {
                Ok(hits) => candidates.extend(hits),
                Err(e) => warn!("Skipping {} rule: {:#}", alert_type, e),
            }
        }

        let dedupe_since = now - (self.config.dedupe_window_secs as i64).saturating_mul(1000);
        let mut seen = HashSet::new();
        let mut created = Vec::new();

        for candidate in candidates {
            if !seen.insert((candidate.plugin_id.clone(), candidate.alert_type)) {
                continue;
            }

            match self
                .alerts
                .find_active(Some(&candidate.plugin_id), candidate.alert_type, dedupe_since)
                .await
            {
                Ok(Some(existing)) => {
                    debug!(
                        "Suppressing {} for {}: alert {} still {}",
                        candidate.alert_type, candidate.plugin_id, existing.id, existing.status
                    );
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Dedupe lookup failed for {}: {:#}", candidate.plugin_id, e);
                    continue;
                }
            }

            let record = self.build_alert(&candidate, now);
            if let Err(e) = self.alerts.insert(&record).await {
                warn!("Failed to store {} alert: {:#}", candidate.alert_type, e);
                continue;
            }

            info!(
                "Raised {} alert ({}) for {}",
                record.alert_type, record.severity, candidate.plugin_id
            );
            if let Some(bus) = &self.bus {
                bus.publish(Event::AlertRaised {
                    alert_id: record.id.clone(),
                    plugin_id: record.plugin_id.clone(),
                    alert_type: record.alert_type,
                    severity: record.severity,
                })
                .await;
            }
            created.push(record);
        }

        DetectionReport {
            success: true,
            alerts_created: created,
            error: None,
        }
    }

    async fn evaluate(
        &self,
        alert_type: AlertType,
        rule: &AlertRule,
        now: i64,
    ) -> anyhow::Result<Vec<Candidate>> {
        let since = now - (rule.window_secs as i64).saturating_mul(1000);

        let counts: Vec<(String, i64, Option<String>)> = match alert_type {
            AlertType::SignatureFailureSpike => self
                .signatures
                .count_failures_by_plugin(since)
                .await?
                .into_iter()
                .map(|(plugin, count)| (plugin, count, None))
                .collect(),
            AlertType::CriticalSeverityEvent => self
                .audit
                .critical_by_plugin(since)
                .await?
                .into_iter()
                .map(|(plugin, count, types)| (plugin, count, Some(types)))
                .collect(),
            _ => self
                .audit
                .count_by_plugin(source_events(alert_type), rule.min_severity, since)
                .await?
                .into_iter()
                .map(|(plugin, count)| (plugin, count, None))
                .collect(),
        };

        Ok(counts
            .into_iter()
            .filter(|(_, count, _)| *count >= 0 && *count as u64 >= rule.threshold)
            .map(|(plugin_id, count, detail)| Candidate {
                plugin_id,
                alert_type,
                count: count as u64,
                detail,
            })
            .collect())
    }

    fn build_alert(&self, candidate: &Candidate, now: i64) -> AlertRecord {
        let rule = self.config.rules.get(candidate.alert_type);
        let severity = scaled_severity(
            rule.severity,
            candidate.count,
            rule.threshold,
            &self.config.severity_bands,
        );
        let window = describe_window(rule.window_secs);

        let description = match candidate.alert_type {
            AlertType::CriticalSeverityEvent => format!(
                "{} critical audit entries in the last {} ({})",
                candidate.count,
                window,
                candidate.detail.as_deref().unwrap_or("unknown")
            ),
            AlertType::SignatureFailureSpike => format!(
                "{} failed signature verifications in the last {} (threshold {})",
                candidate.count, window, rule.threshold
            ),
            other => {
                let sources: Vec<&str> = source_events(other).iter().map(|e| e.as_str()).collect();
                format!(
                    "{} {} events in the last {} (threshold {})",
                    candidate.count,
                    sources.join("/"),
                    window,
                    rule.threshold
                )
            }
        };

        AlertRecord {
            id: uuid::Uuid::new_v4().to_string(),
            plugin_id: Some(candidate.plugin_id.clone()),
            user_id: None,
            alert_type: candidate.alert_type,
            severity,
            title: title_for(candidate.alert_type, &candidate.plugin_id),
            description,
            status: AlertStatus::Open,
            alert_data: json!({
                "count": candidate.count,
                "threshold": rule.threshold,
                "windowSecs": rule.window_secs,
                "ratio": candidate.count as f64 / rule.threshold.max(1) as f64,
                "eventTypes": candidate.detail,
            }),
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move an alert forward; terminal statuses accept no transition
    pub async fn update_alert_status(
        &self,
        alert_id: &str,
        status: AlertStatus,
        actor: Option<&str>,
    ) -> StatusUpdate {
        let current = match self.alerts.get(alert_id).await {
            Ok(Some(alert)) => alert,
            Ok(None) => {
                return StatusUpdate::rejected(EngineError::AlertNotFound(alert_id.to_string()))
            }
            Err(e) => return StatusUpdate::rejected(EngineError::Storage(format!("{:#}", e))),
        };

        let invalid = |from: AlertStatus| EngineError::InvalidAlertTransition {
            from: from.to_string(),
            to: status.to_string(),
        };

        if !current.status.can_transition_to(status) {
            return StatusUpdate::rejected(invalid(current.status));
        }

        match self
            .alerts
            .transition(alert_id, current.status, status, actor, now_millis())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // Someone else moved it first; report against the fresh status
                let latest = self
                    .alerts
                    .get(alert_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|a| a.status)
                    .unwrap_or(current.status);
                return StatusUpdate::rejected(invalid(latest));
            }
            Err(e) => return StatusUpdate::rejected(EngineError::Storage(format!("{:#}", e))),
        }

        info!("Alert {} moved {} -> {}", alert_id, current.status, status);

        StatusUpdate {
            success: true,
            error: None,
            alert: self.alerts.get(alert_id).await.ok().flatten(),
        }
    }

    pub async fn query_alerts(
        &self,
        filter: &AlertFilter,
        pagination: Pagination,
        sort: AlertSortField,
        direction: SortDirection,
    ) -> Result<AlertPage, EngineError> {
        let (alerts, total_count) = self
            .alerts
            .query(filter, pagination, sort, direction)
            .await
            .map_err(|e| EngineError::Storage(format!("{:#}", e)))?;
        let stats = self
            .alerts
            .stats()
            .await
            .map_err(|e| EngineError::Storage(format!("{:#}", e)))?;

        Ok(AlertPage {
            alerts,
            total_count,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bands() -> Vec<SeverityBand> {
        vec![
            SeverityBand {
                min_ratio: 2.0,
                escalate: 1,
            },
            SeverityBand {
                min_ratio: 4.0,
                escalate: 2,
            },
        ]
    }

    #[test]
    fn test_severity_scales_with_ratio() {
        assert_eq!(scaled_severity(Severity::Medium, 10, 10, &bands()), Severity::Medium);
        assert_eq!(scaled_severity(Severity::Medium, 19, 10, &bands()), Severity::Medium);
        assert_eq!(scaled_severity(Severity::Medium, 20, 10, &bands()), Severity::High);
        assert_eq!(scaled_severity(Severity::Medium, 40, 10, &bands()), Severity::Critical);
        assert_eq!(scaled_severity(Severity::High, 400, 10, &bands()), Severity::Critical);
    }

    #[test]
    fn test_severity_without_bands_is_base() {
        assert_eq!(scaled_severity(Severity::Low, 1000, 1, &[]), Severity::Low);
    }

    #[test]
    fn test_every_audit_rule_has_a_source() {
        for alert_type in AlertType::ALL {
            let sources = source_events(alert_type);
            match alert_type {
                AlertType::SignatureFailureSpike | AlertType::CriticalSeverityEvent => {
                    assert!(sources.is_empty())
                }
                _ => assert!(!sources.is_empty(), "{} has no source", alert_type),
            }
        }
    }

    #[test]
    fn test_describe_window() {
        assert_eq!(describe_window(300), "5 min");
        assert_eq!(describe_window(86_400), "24 h");
        assert_eq!(describe_window(90), "90 s");
    }
}
