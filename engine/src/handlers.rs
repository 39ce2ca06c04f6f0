//! Command handlers for CLI operations
//!
//! Each handler opens the database under the configured data directory,
//! wires up the components it needs and prints a text or JSON report.

use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::alerts::{spawn_detection_loop, AnomalyDetector};
use crate::audit::AuditLogger;
use crate::cli::{AlertAction, AuditQueryArgs};
use crate::config::Config;
use crate::db::{
    AlertFilter, AlertSortField, AuditFilter, AuditSortField, Database, Pagination, SortDirection,
};
use crate::loader::{LoadOptions, PluginLoader};
use crate::rate_limiter::RateLimiter;
use crate::registry::PluginRegistry;
use crate::runtime::WasmSandbox;
use crate::signature::{self, SignatureService};
use crate::source::{DirectorySource, PluginSource, MANIFEST_FILE};
use crate::validator::ManifestValidator;
use sdk::{AlertStatus, AlertType, AuditEventType, PluginManifest, Severity, SignatureAlgorithm};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

async fn open_database(config: &Config) -> Result<Database> {
    Database::new(&config.db_path())
        .await
        .context("Failed to open database")
}

fn plugin_source(config: &Config) -> Arc<DirectorySource> {
    Arc::new(DirectorySource::new(config.core.plugins_dir.clone()))
}

fn parse_algorithm(value: &str) -> Result<SignatureAlgorithm> {
    value
        .parse()
        .with_context(|| format!("Unsupported signature algorithm '{}'", value))
}

fn parse_opt<T>(value: Option<&str>) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.map(str::parse::<T>).transpose().map_err(Into::into)
}

fn direction(asc: bool) -> SortDirection {
    if asc {
        SortDirection::Asc
    } else {
        SortDirection::Desc
    }
}

/// Generate a key pair and optionally write it to disk
pub async fn handle_keygen(
    algorithm: &str,
    out: Option<&Path>,
    name: &str,
    format: OutputFormat,
) -> Result<()> {
    let algorithm = parse_algorithm(algorithm)?;
    let pair = signature::generate_key_pair(algorithm)
        .await
        .context("Failed to generate key pair")?;

    let written = match out {
        Some(dir) => {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let private_path = dir.join(format!("{}.key", name));
            let public_path = dir.join(format!("{}.pub", name));
            write_private_key(&private_path, pair.private_key()).await?;
            tokio::fs::write(&public_path, &pair.public_key)
                .await
                .with_context(|| format!("Failed to write {}", public_path.display()))?;
            Some((private_path, public_path))
        }
        None => None,
    };

    match format {
        OutputFormat::Text => {
            println!("Algorithm:  {}", algorithm);
            println!("Public key: {}", pair.public_key);
            match &written {
                Some((private_path, public_path)) => {
                    println!("✓ Private key written to {}", private_path.display());
                    println!("✓ Public key written to {}", public_path.display());
                }
                None => {
                    println!("Private key: {}", pair.private_key());
                    println!();
                    println!("Store the private key now; it is not kept anywhere.");
                }
            }
        }
        OutputFormat::Json => {
            let mut output = json!({
                "algorithm": algorithm,
                "publicKey": pair.public_key,
            });
            match &written {
                Some((private_path, public_path)) => {
                    output["privateKeyPath"] = json!(private_path);
                    output["publicKeyPath"] = json!(public_path);
                }
                None => output["privateKey"] = json!(pair.private_key()),
            }
            print_json(&output)?;
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn write_private_key(path: &Path, key: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::write(path, key)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .with_context(|| format!("Failed to restrict {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
async fn write_private_key(path: &Path, key: &str) -> Result<()> {
    tokio::fs::write(path, key)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Sign a plugin from the plugins directory
pub async fn handle_sign(
    plugin_id: &str,
    key: Option<&Path>,
    algorithm: &str,
    generate: bool,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let algorithm = parse_algorithm(algorithm)?;
    let private_key = match key {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read key file {}", path.display()))?
                .trim()
                .to_string(),
        ),
        None => None,
    };

    if private_key.is_none() && !generate {
        anyhow::bail!("Pass --key <file> or --generate");
    }

    let database = open_database(config).await?;
    let service = SignatureService::new(database.signatures()).with_source(plugin_source(config));

    let outcome = service
        .sign_plugin(plugin_id, private_key.as_deref(), algorithm, generate)
        .await
        .with_context(|| format!("Failed to sign {}", plugin_id))?;

    match format {
        OutputFormat::Text => {
            println!("✓ Signed {}", plugin_id);
            println!("  Signature: {}", outcome.signature);
            println!("  Code hash: {}", outcome.code_hash);
            println!("  Signed at: {}", format_millis(outcome.signed_at));
            if let Some(public_key) = &outcome.public_key {
                println!("  Public key:  {}", public_key);
            }
            if let Some(private_key) = &outcome.private_key {
                println!("  Private key: {}", private_key);
            }
        }
        OutputFormat::Json => print_json(&serde_json::to_value(&outcome)?)?,
    }

    database.close().await?;
    Ok(())
}

/// Verify a plugin against its stored signature
pub async fn handle_verify(
    plugin_id: &str,
    user: Option<&str>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = open_database(config).await?;
    let service = SignatureService::new(database.signatures()).with_source(plugin_source(config));

    let outcome = service.verify_plugin(plugin_id, user).await;

    match format {
        OutputFormat::Text => {
            let mark = if outcome.result.is_valid() { "✓" } else { "✗" };
            println!("{} {}: {}", mark, plugin_id, outcome.result);
            if let Some(message) = &outcome.error_message {
                println!("  {}", message);
            }
        }
        OutputFormat::Json => print_json(&json!({
            "pluginId": plugin_id,
            "result": outcome.result,
            "errorMessage": outcome.error_message,
        }))?,
    }

    database.close().await?;
    Ok(())
}

/// Validate a manifest from the plugins directory
pub async fn handle_validate(plugin_id: &str, config: &Config, format: OutputFormat) -> Result<()> {
    if plugin_id.is_empty() || plugin_id.contains(['/', '\\']) || plugin_id.starts_with('.') {
        anyhow::bail!("Invalid plugin id: {:?}", plugin_id);
    }

    let path = config.core.plugins_dir.join(plugin_id).join(MANIFEST_FILE);
    let contents = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let manifest = PluginManifest::from_json(&contents)
        .with_context(|| format!("{} is not a valid manifest document", path.display()))?;

    let report = ManifestValidator::new()?.validate(&manifest);

    match format {
        OutputFormat::Text => {
            if report.valid {
                println!("✓ {} is valid", plugin_id);
            } else {
                println!("✗ {} is invalid", plugin_id);
            }
            for error in &report.errors {
                println!("  error:   {}", error);
            }
            for warning in &report.warnings {
                println!("  warning: {}", warning);
            }
        }
        OutputFormat::Json => print_json(&serde_json::to_value(&report)?)?,
    }

    Ok(())
}

/// Load a plugin into the sandbox, report, then unload it
pub async fn handle_load(
    plugin_id: &str,
    disabled: bool,
    require_signature: bool,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = open_database(config).await?;
    let source = plugin_source(config);

    let bundle = source
        .fetch(plugin_id)
        .await
        .with_context(|| format!("Failed to read plugin {}", plugin_id))?;

    let audit = AuditLogger::new(database.audit());
    let loader = PluginLoader::new(
        Arc::new(tokio::sync::RwLock::new(PluginRegistry::new())),
        SignatureService::new(database.signatures()),
        Arc::new(WasmSandbox::new(Duration::from_millis(
            config.loader.execution_timeout_ms,
        ))),
        audit.clone(),
        Arc::new(RateLimiter::new(config.rate_limits.clone())),
        config.loader.clone(),
    )?
    .with_source(source);

    let result = loader
        .load_plugin(
            bundle.manifest,
            bundle.code,
            LoadOptions {
                enable_immediately: !disabled,
                require_signature,
                ..Default::default()
            },
        )
        .await;

    let unloaded = if result.success {
        Some(loader.unload_plugin(plugin_id).await)
    } else {
        None
    };

    audit.flush().await;

    match format {
        OutputFormat::Text => {
            match (&result.plugin, &result.error) {
                (Some(plugin), _) => {
                    println!("✓ Loaded {} {} ({})", plugin.name, plugin.version, plugin.id);
                    println!("  Enabled: {}", plugin.enabled);
                    let methods: Vec<&str> = plugin.methods.iter().map(|m| m.as_str()).collect();
                    println!("  Methods: {}", methods.join(", "));
                }
                (None, error) => {
                    println!("✗ Failed to load {}", plugin_id);
                    println!("  {}", error.as_deref().unwrap_or("unknown error"));
                }
            }
            if let Some(unload) = &unloaded {
                if let Some(warning) = &unload.warning {
                    println!("  Unload warning: {}", warning);
                } else if let Some(error) = &unload.error {
                    println!("  Unload error: {}", error);
                }
            }
        }
        OutputFormat::Json => print_json(&json!({
            "load": result,
            "unload": unloaded,
        }))?,
    }

    database.close().await?;
    Ok(())
}

/// Query the audit log
pub async fn handle_audit(
    query: &AuditQueryArgs,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let filter = AuditFilter {
        plugin_id: query.plugin.clone(),
        user_id: query.user.clone(),
        event_type: parse_opt::<AuditEventType>(query.event_type.as_deref())?,
        severity: parse_opt::<Severity>(query.severity.as_deref())?,
        search: query.search.clone(),
        ..Default::default()
    };
    let sort: AuditSortField = query.sort.parse().map_err(anyhow::Error::msg)?;

    let database = open_database(config).await?;
    let audit = AuditLogger::new(database.audit());
    let page = audit
        .query(
            &filter,
            Pagination::new(query.page, query.limit),
            sort,
            direction(query.asc),
        )
        .await?;

    match format {
        OutputFormat::Text => {
            if page.entries.is_empty() {
                println!("No audit entries");
            } else {
                println!(
                    "Audit log: {} of {} entries (page {})",
                    page.entries.len(),
                    page.total_count,
                    query.page
                );
                println!();
                for entry in &page.entries {
                    println!(
                        "{}  {:<8}  {:<28}  {}",
                        format_millis(entry.created_at),
                        entry.severity,
                        entry.event_type,
                        entry.plugin_id
                    );
                    if let Some(user) = &entry.user_id {
                        println!("    user: {}", user);
                    }
                    if !entry.event_data.is_null() {
                        println!("    data: {}", entry.event_data);
                    }
                }
            }
        }
        OutputFormat::Json => print_json(&serde_json::to_value(&page)?)?,
    }

    database.close().await?;
    Ok(())
}

fn detector(database: &Database, config: &Config) -> AnomalyDetector {
    AnomalyDetector::new(
        database.audit(),
        database.signatures(),
        database.alerts(),
        config.alerts.clone(),
    )
}

/// List or update alerts
pub async fn handle_alerts(
    action: &AlertAction,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = open_database(config).await?;
    let detector = detector(&database, config);

    match action {
        AlertAction::List {
            status,
            severity,
            alert_type,
            plugin,
            search,
            page,
            limit,
            sort,
            asc,
        } => {
            let filter = AlertFilter {
                status: parse_opt::<AlertStatus>(status.as_deref())?,
                severity: parse_opt::<Severity>(severity.as_deref())?,
                alert_type: parse_opt::<AlertType>(alert_type.as_deref())?,
                plugin_id: plugin.clone(),
                search: search.clone(),
            };
            let sort: AlertSortField = sort.parse().map_err(anyhow::Error::msg)?;

            let result = detector
                .query_alerts(&filter, Pagination::new(*page, *limit), sort, direction(*asc))
                .await?;

            match format {
                OutputFormat::Text => {
                    let stats = &result.stats;
                    println!(
                        "Alerts: {} total, {} open, {} acknowledged, {} resolved, {} dismissed",
                        stats.total, stats.open, stats.acknowledged, stats.resolved, stats.dismissed
                    );
                    println!();
                    if result.alerts.is_empty() {
                        println!("No matching alerts");
                    }
                    for alert in &result.alerts {
                        println!(
                            "{}  [{}] {} ({})",
                            alert.id, alert.severity, alert.title, alert.status
                        );
                        println!("    {}", alert.description);
                        println!("    Created: {}", format_millis(alert.created_at));
                    }
                }
                OutputFormat::Json => print_json(&serde_json::to_value(&result)?)?,
            }
        }
        AlertAction::Update {
            alert_id,
            status,
            actor,
        } => {
            let status: AlertStatus = status.parse()?;
            let update = detector
                .update_alert_status(alert_id, status, actor.as_deref())
                .await;

            match format {
                OutputFormat::Text => {
                    if update.success {
                        println!("✓ Alert {} is now {}", alert_id, status);
                    } else {
                        println!(
                            "✗ {}",
                            update.error.as_deref().unwrap_or("Status update failed")
                        );
                    }
                }
                OutputFormat::Json => print_json(&serde_json::to_value(&update)?)?,
            }
        }
    }

    database.close().await?;
    Ok(())
}

/// Run one detection pass
pub async fn handle_detect(config: &Config, format: OutputFormat) -> Result<()> {
    let database = open_database(config).await?;
    let report = detector(&database, config).run_anomaly_detection().await;

    match format {
        OutputFormat::Text => {
            if !report.success {
                println!(
                    "✗ Detection failed: {}",
                    report.error.as_deref().unwrap_or("unknown error")
                );
            } else if report.alerts_created.is_empty() {
                println!("✓ No new alerts");
            } else {
                println!("Raised {} alert(s):", report.alerts_created.len());
                for alert in &report.alerts_created {
                    println!("  [{}] {}", alert.severity, alert.title);
                }
            }
        }
        OutputFormat::Json => print_json(&serde_json::to_value(&report)?)?,
    }

    database.close().await?;
    Ok(())
}

/// Run detection on an interval until Ctrl+C
pub async fn handle_monitor(interval: Option<u64>, config: &Config) -> Result<()> {
    let database = open_database(config).await?;
    let secs = interval.unwrap_or(config.alerts.detection_interval_secs).max(1);

    let bus = Arc::new(crate::message_bus::MessageBus::new());
    let mut raised = bus.subscribe(crate::message_bus::EventType::AlertRaised).await;
    let detector = Arc::new(detector(&database, config).with_message_bus(bus));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = spawn_detection_loop(detector, Duration::from_secs(secs), shutdown_rx);

    println!("Monitoring every {}s. Press Ctrl+C to stop.", secs);

    loop {
        tokio::select! {
            event = raised.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    handle.await.context("Detection loop panicked")?;
    database.close().await?;
    Ok(())
}

/// Validate configuration and storage
pub async fn handle_doctor(config: &Config, format: OutputFormat) -> Result<()> {
    let mut issues = Vec::new();
    let mut checks = Vec::new();

    // Config is already validated when loaded
    checks.push(("Configuration", "Valid".to_string()));

    if config.core.data_dir.exists() {
        checks.push(("Data directory", "Exists".to_string()));
    } else {
        checks.push(("Data directory", "Missing".to_string()));
        issues.push(format!(
            "Data directory does not exist: {}",
            config.core.data_dir.display()
        ));
    }

    if config.core.plugins_dir.exists() {
        let source = DirectorySource::new(config.core.plugins_dir.clone());
        match source.list_ids().await {
            Ok(ids) => checks.push(("Plugins directory", format!("{} plugin(s)", ids.len()))),
            Err(e) => {
                checks.push(("Plugins directory", "Unreadable".to_string()));
                issues.push(format!("Cannot list plugins: {:#}", e));
            }
        }
    } else {
        checks.push(("Plugins directory", "Missing".to_string()));
        issues.push(format!(
            "Plugins directory does not exist: {}",
            config.core.plugins_dir.display()
        ));
    }

    match Database::new(&config.db_path()).await {
        Ok(database) => {
            checks.push(("Database connection", "OK".to_string()));
            match database.audit().count_all().await {
                Ok(count) => checks.push(("Audit entries", count.to_string())),
                Err(e) => issues.push(format!("Cannot read audit log: {:#}", e)),
            }
            match database.alerts().stats().await {
                Ok(stats) => checks.push(("Open alerts", stats.open.to_string())),
                Err(e) => issues.push(format!("Cannot read alerts: {:#}", e)),
            }
            database.close().await?;
        }
        Err(e) => {
            checks.push(("Database connection", "Failed".to_string()));
            issues.push(format!("Cannot connect to database: {:#}", e));
        }
    }

    if ManifestValidator::new().is_ok() {
        checks.push(("Manifest validator", "OK".to_string()));
    } else {
        issues.push("Manifest validator failed to initialize".to_string());
    }

    checks.push((
        "Signatures required",
        if config.loader.require_signature { "Yes" } else { "No" }.to_string(),
    ));

    match format {
        OutputFormat::Text => {
            println!("Warden diagnostics");
            println!();
            for (name, status) in &checks {
                println!("  {:<22} {}", name, status);
            }
            println!();
            if issues.is_empty() {
                println!("✓ No issues found");
            } else {
                println!("Issues:");
                for issue in &issues {
                    println!("  • {}", issue);
                }
            }
        }
        OutputFormat::Json => {
            let checks: serde_json::Map<String, serde_json::Value> = checks
                .iter()
                .map(|(name, status)| (name.to_string(), json!(status)))
                .collect();
            print_json(&json!({
                "checks": checks,
                "issues": issues,
                "healthy": issues.is_empty(),
            }))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_opt() {
        assert_eq!(parse_opt::<Severity>(None).unwrap(), None);
        assert_eq!(
            parse_opt::<Severity>(Some("high")).unwrap(),
            Some(Severity::High)
        );
        assert!(parse_opt::<Severity>(Some("urgent")).is_err());
    }

    #[test]
    fn test_format_millis() {
        assert_eq!(format_millis(0), "1970-01-01 00:00:00");
    }

    #[tokio::test]
    async fn test_validate_rejects_path_like_id() {
        let config = Config::default();
        assert!(handle_validate("../etc", &config, OutputFormat::Json)
            .await
            .is_err());
    }
}
