//! Security vocabulary shared by the engine and its operator surfaces
//!
//! Every enum here has a stable snake_case wire name (`as_str`) which is what
//! gets persisted to the database and printed by the CLI. Parsing goes through
//! `FromStr` so that unknown values surface as `UnknownVariant` instead of
//! being silently mapped to a default.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when parsing a wire name that is not part of a closed set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Severity of an audit entry or alert
///
/// Variants are declared in ascending order so the derived `Ord` matches
/// the security ranking (`Low < Medium < High < Critical`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Numeric rank used for ordering in storage queries
    pub fn rank(&self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    /// Raise the severity by `levels`, saturating at `Critical`
    pub fn escalate(self, levels: u8) -> Self {
        let target = self.rank().saturating_add(levels).min(3);
        Self::ALL[target as usize]
    }

    /// All severities at or above `self`
    pub fn at_least(self) -> impl Iterator<Item = Severity> {
        Self::ALL.into_iter().filter(move |s| *s >= self)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(UnknownVariant::new("severity", other)),
        }
    }
}

/// Kind of runtime security event recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ApiCall,
    ApiCallFailed,
    RateLimitViolation,
    ExecutionTimeout,
    StorageAccess,
    StorageQuotaExceeded,
    PluginError,
    PluginTerminated,
    UnauthorizedAccessAttempt,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiCall => "api_call",
            Self::ApiCallFailed => "api_call_failed",
            Self::RateLimitViolation => "rate_limit_violation",
            Self::ExecutionTimeout => "execution_timeout",
            Self::StorageAccess => "storage_access",
            Self::StorageQuotaExceeded => "storage_quota_exceeded",
            Self::PluginError => "plugin_error",
            Self::PluginTerminated => "plugin_terminated",
            Self::UnauthorizedAccessAttempt => "unauthorized_access_attempt",
        }
    }

    /// Severity assigned when the caller does not choose one
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::ApiCall | Self::StorageAccess => Severity::Low,
            Self::ApiCallFailed | Self::PluginError | Self::PluginTerminated => Severity::Medium,
            Self::RateLimitViolation
            | Self::ExecutionTimeout
            | Self::StorageQuotaExceeded
            | Self::UnauthorizedAccessAttempt => Severity::High,
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api_call" => Ok(Self::ApiCall),
            "api_call_failed" => Ok(Self::ApiCallFailed),
            "rate_limit_violation" => Ok(Self::RateLimitViolation),
            "execution_timeout" => Ok(Self::ExecutionTimeout),
            "storage_access" => Ok(Self::StorageAccess),
            "storage_quota_exceeded" => Ok(Self::StorageQuotaExceeded),
            "plugin_error" => Ok(Self::PluginError),
            "plugin_terminated" => Ok(Self::PluginTerminated),
            "unauthorized_access_attempt" => Ok(Self::UnauthorizedAccessAttempt),
            other => Err(UnknownVariant::new("audit event type", other)),
        }
    }
}

/// Kind of alert raised by the anomaly detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    RateLimitSpike,
    SignatureFailureSpike,
    ExecutionTimeoutSpike,
    StorageQuotaSpike,
    UnauthorizedAccessSpike,
    ApiCallAnomaly,
    PluginErrorSpike,
    CriticalSeverityEvent,
}

impl AlertType {
    pub const ALL: [AlertType; 8] = [
        AlertType::RateLimitSpike,
        AlertType::SignatureFailureSpike,
        AlertType::ExecutionTimeoutSpike,
        AlertType::StorageQuotaSpike,
        AlertType::UnauthorizedAccessSpike,
        AlertType::ApiCallAnomaly,
        AlertType::PluginErrorSpike,
        AlertType::CriticalSeverityEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimitSpike => "rate_limit_spike",
            Self::SignatureFailureSpike => "signature_failure_spike",
            Self::ExecutionTimeoutSpike => "execution_timeout_spike",
            Self::StorageQuotaSpike => "storage_quota_spike",
            Self::UnauthorizedAccessSpike => "unauthorized_access_spike",
            Self::ApiCallAnomaly => "api_call_anomaly",
            Self::PluginErrorSpike => "plugin_error_spike",
            Self::CriticalSeverityEvent => "critical_severity_event",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("alert type", s))
    }
}

/// Lifecycle status of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Resolved,
    Dismissed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
            Self::Dismissed => "dismissed",
        }
    }

    /// Position on the path toward a terminal state
    fn rank(&self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Acknowledged => 1,
            Self::Resolved | Self::Dismissed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Dismissed)
    }

    /// Whether an alert in this status may still suppress duplicates
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Open | Self::Acknowledged)
    }

    /// Transitions only move forward; terminal states have no successors.
    pub fn can_transition_to(&self, next: AlertStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "acknowledged" => Ok(Self::Acknowledged),
            "resolved" => Ok(Self::Resolved),
            "dismissed" => Ok(Self::Dismissed),
            other => Err(UnknownVariant::new("alert status", other)),
        }
    }
}

/// Outcome of a signature verification attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationResult {
    Valid,
    Invalid,
    Missing,
    Error,
}

impl VerificationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Missing => "missing",
            Self::Error => "error",
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationResult {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(Self::Valid),
            "invalid" => Ok(Self::Invalid),
            "missing" => Ok(Self::Missing),
            "error" => Ok(Self::Error),
            other => Err(UnknownVariant::new("verification result", other)),
        }
    }
}

/// Signature algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAlgorithm {
    #[default]
    Ed25519,
    Rsa,
}

impl SignatureAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::Rsa => "rsa",
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" => Ok(Self::Ed25519),
            "rsa" => Ok(Self::Rsa),
            _ => Err(UnknownVariant::new("signature algorithm", s)),
        }
    }
}
