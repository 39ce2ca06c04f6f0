/// Integration tests for configuration loading
///
/// Exercises the full TOML surface: core paths, loader timeouts,
/// rate limits, per-rule alert overrides and severity bands.
use sdk::{AlertType, Severity};
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};
use warden_engine::config::Config;

fn full_config(dir: &TempDir) -> String {
    format!(
        r#"
[core]
log_level = "debug"
data_dir = "{data}"
plugins_dir = "{plugins}"

[loader]
activation_timeout_ms = 2000
dispose_timeout_ms = 750
execution_timeout_ms = 15000
require_signature = true

[rate_limits]
max_calls_per_minute = 30
max_calls_per_hour = 500
max_storage_bytes = 1048576
max_concurrent_calls = 2

[alerts]
dedupe_window_secs = 3600
detection_interval_secs = 30
severity_bands = [
    {{ min_ratio = 3.0, escalate = 1 }},
    {{ min_ratio = 6.0, escalate = 2 }},
]

[alerts.rules.signature_failure_spike]
window_secs = 120
threshold = 2
severity = "high"

[alerts.rules.api_call_anomaly]
enabled = false
window_secs = 60
threshold = 100
severity = "medium"
"#,
        data = dir.path().join("data").display(),
        plugins = dir.path().join("plugins").display(),
    )
}

#[test]
fn test_full_config_parses() {
    let dir = TempDir::new().unwrap();
    let config = Config::from_toml_str(&full_config(&dir)).unwrap();

    assert_eq!(config.core.log_level, "debug");
    assert_eq!(config.core.data_dir, dir.path().join("data"));
    assert_eq!(config.db_path(), dir.path().join("data").join("warden.db"));

    assert_eq!(config.loader.dispose_timeout_ms, 750);
    assert!(config.loader.require_signature);

    assert_eq!(config.rate_limits.max_calls_per_minute, 30);
    assert_eq!(config.rate_limits.max_storage_bytes, 1_048_576);

    assert_eq!(config.alerts.dedupe_window_secs, 3600);
    assert_eq!(config.alerts.severity_bands.len(), 2);
    assert_eq!(config.alerts.severity_bands[1].min_ratio, 6.0);

    let signature = config.alerts.rules.get(AlertType::SignatureFailureSpike);
    assert_eq!(signature.threshold, 2);
    assert_eq!(signature.severity, Severity::High);
    assert!(signature.enabled);

    assert!(!config.alerts.rules.get(AlertType::ApiCallAnomaly).enabled);

    // Untouched rules keep their defaults
    let unauthorized = config.alerts.rules.get(AlertType::UnauthorizedAccessSpike);
    assert_eq!(unauthorized.threshold, 3);
    assert_eq!(unauthorized.min_severity, Some(Severity::High));
}

#[test]
fn test_load_from_path() {
    let dir = TempDir::new().unwrap();
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(full_config(&dir).as_bytes()).unwrap();

    let config = Config::load_from_path(file.path()).unwrap();

    assert_eq!(config.loader.execution_timeout_ms, 15_000);
    assert!(dir.path().join("data").exists());
}

#[test]
fn test_missing_file_is_error() {
    let dir = TempDir::new().unwrap();

    let result = Config::load_from_path(&dir.path().join("absent.toml"));

    assert!(result.is_err());
}

#[test]
fn test_unknown_severity_rejected() {
    let dir = TempDir::new().unwrap();
    let toml = format!(
        r#"
[core]
data_dir = "{}"

[alerts.rules.plugin_error_spike]
window_secs = 600
threshold = 10
severity = "catastrophic"
"#,
        dir.path().join("data").display()
    );

    assert!(Config::from_toml_str(&toml).is_err());
}

#[test]
fn test_invalid_log_level_rejected() {
    let dir = TempDir::new().unwrap();
    let toml = format!(
        r#"
[core]
log_level = "loud"
data_dir = "{}"
"#,
        dir.path().join("data").display()
    );

    let err = Config::from_toml_str(&toml).unwrap_err();
    assert!(err.to_string().contains("Invalid log level"));
}

#[test]
fn test_band_below_one_rejected() {
    let toml = r#"
[alerts]
severity_bands = [{ min_ratio = 0.5, escalate = 1 }]
"#;

    assert!(Config::from_toml_str(toml).is_err());
}
