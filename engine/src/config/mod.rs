//! Configuration management
//!
//! This module handles loading, validation, and management of the Warden
//! configuration. Configuration is stored in TOML format at
//! ~/.warden/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: log level, data directory, plugin source directory
//! - **loader**: activation, dispose and execution timeouts; signature policy
//! - **rate_limits**: per-plugin call and storage quotas
//! - **alerts**: detection schedule, dedupe window, severity bands and one
//!   rule per alert type
//!
//! Every field has a default, so a config file only needs the keys it
//! overrides.
//!
//! # Examples
//!
//! ```no_run
//! use warden_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Dedupe window: {}s", config.alerts.dedupe_window_secs);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use sdk::{AlertType, Severity};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Database file name inside the data directory
pub const DB_FILE_NAME: &str = "warden.db";

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Plugin loader settings
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Per-plugin quotas
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Anomaly detection policy
    #[serde(default)]
    pub alerts: AlertsConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory holding one sub-directory per plugin id
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: PathBuf,
}

/// Plugin loader configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Upper bound on the plugin's activation call
    #[serde(default = "default_activation_timeout_ms")]
    pub activation_timeout_ms: u64,

    /// Upper bound on `dispose()` during unload
    #[serde(default = "default_dispose_timeout_ms")]
    pub dispose_timeout_ms: u64,

    /// Upper bound on a single capability invocation
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,

    /// Require a valid signature for every load
    #[serde(default)]
    pub require_signature: bool,
}

/// Per-plugin rate limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_calls_per_minute")]
    pub max_calls_per_minute: u32,

    #[serde(default = "default_max_calls_per_hour")]
    pub max_calls_per_hour: u32,

    #[serde(default = "default_max_storage_bytes")]
    pub max_storage_bytes: u64,

    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: u32,
}

/// Anomaly detection and alerting policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// An open or acknowledged alert created within this window suppresses
    /// a new alert for the same (plugin, alert type)
    #[serde(default = "default_dedupe_window_secs")]
    pub dedupe_window_secs: u64,

    /// Interval between scheduled detection runs (`warden monitor`)
    #[serde(default = "default_detection_interval_secs")]
    pub detection_interval_secs: u64,

    /// Escalation bands keyed by count / threshold
    #[serde(default = "default_severity_bands")]
    pub severity_bands: Vec<SeverityBand>,

    #[serde(default)]
    pub rules: AlertRules,
}

/// Raises an alert's severity when the count reaches `min_ratio` times the
/// rule threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityBand {
    pub min_ratio: f64,
    pub escalate: u8,
}

/// Detection rule for one alert type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Trailing window counted by the rule
    pub window_secs: u64,

    /// Count at which the rule fires
    pub threshold: u64,

    /// Entries below this severity are not counted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<Severity>,

    /// Severity of the alert before band escalation
    pub severity: Severity,
}

impl AlertRule {
    fn new(
        window_secs: u64,
        threshold: u64,
        min_severity: Option<Severity>,
        severity: Severity,
    ) -> Self {
        Self {
            enabled: true,
            window_secs,
            threshold,
            min_severity,
            severity,
        }
    }
}

/// One rule per alert type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRules {
    #[serde(default = "default_rate_limit_rule")]
    pub rate_limit_spike: AlertRule,
    #[serde(default = "default_signature_failure_rule")]
    pub signature_failure_spike: AlertRule,
    #[serde(default = "default_execution_timeout_rule")]
    pub execution_timeout_spike: AlertRule,
    #[serde(default = "default_storage_quota_rule")]
    pub storage_quota_spike: AlertRule,
    #[serde(default = "default_unauthorized_access_rule")]
    pub unauthorized_access_spike: AlertRule,
    #[serde(default = "default_api_call_rule")]
    pub api_call_anomaly: AlertRule,
    #[serde(default = "default_plugin_error_rule")]
    pub plugin_error_spike: AlertRule,
    #[serde(default = "default_critical_event_rule")]
    pub critical_severity_event: AlertRule,
}

impl AlertRules {
    /// Rule for an alert type
    pub fn get(&self, alert_type: AlertType) -> &AlertRule {
        match alert_type {
            AlertType::RateLimitSpike => &self.rate_limit_spike,
            AlertType::SignatureFailureSpike => &self.signature_failure_spike,
            AlertType::ExecutionTimeoutSpike => &self.execution_timeout_spike,
            AlertType::StorageQuotaSpike => &self.storage_quota_spike,
            AlertType::UnauthorizedAccessSpike => &self.unauthorized_access_spike,
            AlertType::ApiCallAnomaly => &self.api_call_anomaly,
            AlertType::PluginErrorSpike => &self.plugin_error_spike,
            AlertType::CriticalSeverityEvent => &self.critical_severity_event,
        }
    }

    pub fn get_mut(&mut self, alert_type: AlertType) -> &mut AlertRule {
        match alert_type {
            AlertType::RateLimitSpike => &mut self.rate_limit_spike,
            AlertType::SignatureFailureSpike => &mut self.signature_failure_spike,
            AlertType::ExecutionTimeoutSpike => &mut self.execution_timeout_spike,
            AlertType::StorageQuotaSpike => &mut self.storage_quota_spike,
            AlertType::UnauthorizedAccessSpike => &mut self.unauthorized_access_spike,
            AlertType::ApiCallAnomaly => &mut self.api_call_anomaly,
            AlertType::PluginErrorSpike => &mut self.plugin_error_spike,
            AlertType::CriticalSeverityEvent => &mut self.critical_severity_event,
        }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.warden/data")
}

fn default_plugins_dir() -> PathBuf {
    PathBuf::from("~/.warden/plugins")
}

fn default_activation_timeout_ms() -> u64 {
    30_000
}

fn default_dispose_timeout_ms() -> u64 {
    5_000
}

fn default_execution_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_max_calls_per_minute() -> u32 {
    60
}

fn default_max_calls_per_hour() -> u32 {
    3600
}

fn default_max_storage_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_concurrent_calls() -> u32 {
    10
}

fn default_dedupe_window_secs() -> u64 {
    24 * 60 * 60
}

fn default_detection_interval_secs() -> u64 {
    5 * 60
}

fn default_severity_bands() -> Vec<SeverityBand> {
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

fn default_rate_limit_rule() -> AlertRule {
    AlertRule::new(5 * 60, 10, Some(Severity::Medium), Severity::High)
}

fn default_signature_failure_rule() -> AlertRule {
    AlertRule::new(10 * 60, 5, None, Severity::Critical)
}

fn default_execution_timeout_rule() -> AlertRule {
    AlertRule::new(15 * 60, 5, Some(Severity::High), Severity::High)
}

fn default_storage_quota_rule() -> AlertRule {
    AlertRule::new(10 * 60, 3, Some(Severity::Medium), Severity::Medium)
}

fn default_unauthorized_access_rule() -> AlertRule {
    AlertRule::new(5 * 60, 3, Some(Severity::High), Severity::Critical)
}

fn default_api_call_rule() -> AlertRule {
    AlertRule::new(60, 100, None, Severity::Medium)
}

fn default_plugin_error_rule() -> AlertRule {
    AlertRule::new(10 * 60, 10, Some(Severity::Medium), Severity::High)
}

fn default_critical_event_rule() -> AlertRule {
    AlertRule::new(24 * 60 * 60, 1, Some(Severity::Critical), Severity::Critical)
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            plugins_dir: default_plugins_dir(),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            activation_timeout_ms: default_activation_timeout_ms(),
            dispose_timeout_ms: default_dispose_timeout_ms(),
            execution_timeout_ms: default_execution_timeout_ms(),
            require_signature: false,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls_per_minute: default_max_calls_per_minute(),
            max_calls_per_hour: default_max_calls_per_hour(),
            max_storage_bytes: default_max_storage_bytes(),
            max_concurrent_calls: default_max_concurrent_calls(),
        }
    }
}

impl Default for AlertRules {
    fn default() -> Self {
        Self {
            rate_limit_spike: default_rate_limit_rule(),
            signature_failure_spike: default_signature_failure_rule(),
            execution_timeout_spike: default_execution_timeout_rule(),
            storage_quota_spike: default_storage_quota_rule(),
            unauthorized_access_spike: default_unauthorized_access_rule(),
            api_call_anomaly: default_api_call_rule(),
            plugin_error_spike: default_plugin_error_rule(),
            critical_severity_event: default_critical_event_rule(),
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            dedupe_window_secs: default_dedupe_window_secs(),
            detection_interval_secs: default_detection_interval_secs(),
            severity_bands: default_severity_bands(),
            rules: AlertRules::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            loader: LoaderConfig::default(),
            rate_limits: RateLimitConfig::default(),
            alerts: AlertsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.warden/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let defaults = Self::default();

        // Written before path expansion so the file stays portable
        let toml_string = toml::to_string_pretty(&defaults)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = defaults;
        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.warden/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".warden").join("config.toml"))
    }

    /// Path of the SQLite database
    pub fn db_path(&self) -> PathBuf {
        self.core.data_dir.join(DB_FILE_NAME)
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates the log level
    /// - Rejects zero windows, thresholds, timeouts and quotas
    /// - Checks severity bands are ascending
    /// - Expands ~ in paths and creates the data directory
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let timeouts = [
            ("activation_timeout_ms", self.loader.activation_timeout_ms),
            ("dispose_timeout_ms", self.loader.dispose_timeout_ms),
            ("execution_timeout_ms", self.loader.execution_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(EngineError::Config(format!("loader.{} must be > 0", name)));
            }
        }

        if self.rate_limits.max_calls_per_minute == 0
            || self.rate_limits.max_calls_per_hour == 0
            || self.rate_limits.max_concurrent_calls == 0
        {
            return Err(EngineError::Config(
                "rate_limits values must be > 0".to_string(),
            ));
        }

        for alert_type in AlertType::ALL {
            let rule = self.alerts.rules.get(alert_type);
            if rule.window_secs == 0 || rule.threshold == 0 {
                return Err(EngineError::Config(format!(
                    "alerts.rules.{} needs window_secs > 0 and threshold > 0",
                    alert_type
                )));
            }
        }

        let mut previous = 1.0_f64;
        for band in &self.alerts.severity_bands {
            if !band.min_ratio.is_finite() || band.min_ratio < previous {
                return Err(EngineError::Config(
                    "alerts.severity_bands must be ascending with min_ratio >= 1.0".to_string(),
                ));
            }
            previous = band.min_ratio;
        }

        if self.alerts.detection_interval_secs == 0 {
            return Err(EngineError::Config(
                "alerts.detection_interval_secs must be > 0".to_string(),
            ));
        }

        self.core.plugins_dir = expand_path(&self.core.plugins_dir)?;
        self.core.data_dir = expand_path(&self.core.data_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
