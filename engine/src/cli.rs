//! CLI interface for Warden
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for the operator tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Warden plugin security engine
///
/// Validates, signs and verifies plugins, test-loads them into the sandbox,
/// and inspects the security audit trail and alerts.
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a signing key pair
    Keygen {
        /// Signature algorithm (ed25519, rsa)
        #[arg(short, long, default_value = "ed25519")]
        algorithm: String,

        /// Directory to write `<name>.key` and `<name>.pub` into
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Base file name for the key files
        #[arg(long, default_value = "warden")]
        name: String,
    },

    /// Sign a plugin from the plugins directory
    Sign {
        /// Plugin ID
        plugin_id: String,

        /// File holding the private key
        #[arg(short, long, conflicts_with = "generate")]
        key: Option<PathBuf>,

        /// Signature algorithm (ed25519, rsa)
        #[arg(short, long, default_value = "ed25519")]
        algorithm: String,

        /// Generate a fresh key pair for this signature
        #[arg(long)]
        generate: bool,
    },

    /// Verify a plugin against its stored signature
    Verify {
        /// Plugin ID
        plugin_id: String,

        /// Recorded as the verifying user
        #[arg(long)]
        user: Option<String>,
    },

    /// Validate a plugin's manifest from the plugins directory
    Validate {
        /// Plugin ID
        plugin_id: String,
    },

    /// Test-load a plugin into the sandbox, then unload it
    Load {
        /// Plugin ID
        plugin_id: String,

        /// Register the plugin without enabling it
        #[arg(long)]
        disabled: bool,

        /// Refuse plugins without a valid signature
        #[arg(long)]
        require_signature: bool,
    },

    /// Query the security audit log
    Audit {
        #[command(flatten)]
        query: AuditQueryArgs,
    },

    /// Inspect and manage security alerts
    Alerts {
        #[command(subcommand)]
        action: AlertAction,
    },

    /// Run one anomaly detection pass
    Detect,

    /// Run anomaly detection periodically until interrupted
    Monitor {
        /// Seconds between passes (defaults to the configured interval)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Run system diagnostics
    Doctor,
}

/// Audit log filters
#[derive(clap::Args, Debug, Default)]
pub struct AuditQueryArgs {
    /// Only entries for this plugin
    #[arg(long)]
    pub plugin: Option<String>,

    /// Only entries for this user
    #[arg(long)]
    pub user: Option<String>,

    /// Event type (e.g. rate_limit_violation)
    #[arg(long = "event", value_name = "EVENT_TYPE")]
    pub event_type: Option<String>,

    /// Exact severity (low, medium, high, critical)
    #[arg(long)]
    pub severity: Option<String>,

    /// Case-insensitive substring of plugin id or event type
    #[arg(long)]
    pub search: Option<String>,

    /// Page number, starting at 1
    #[arg(long, default_value = "1")]
    pub page: u32,

    /// Entries per page
    #[arg(short, long, default_value = "20")]
    pub limit: u32,

    /// Sort field (created_at, severity, event_type, plugin_id)
    #[arg(long, default_value = "created_at")]
    pub sort: String,

    /// Oldest first
    #[arg(long)]
    pub asc: bool,
}

/// Alert actions
#[derive(Subcommand, Debug)]
pub enum AlertAction {
    /// List alerts with summary stats
    List {
        /// Status (open, acknowledged, resolved, dismissed)
        #[arg(long)]
        status: Option<String>,

        /// Severity (low, medium, high, critical)
        #[arg(long)]
        severity: Option<String>,

        /// Alert type (e.g. rate_limit_spike)
        #[arg(long = "type", value_name = "ALERT_TYPE")]
        alert_type: Option<String>,

        /// Only alerts for this plugin
        #[arg(long)]
        plugin: Option<String>,

        /// Substring match over title and description
        #[arg(long)]
        search: Option<String>,

        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(short, long, default_value = "20")]
        limit: u32,

        /// Sort field (created_at, severity, status)
        #[arg(long, default_value = "created_at")]
        sort: String,

        /// Oldest first
        #[arg(long)]
        asc: bool,
    },

    /// Move an alert to a new status
    Update {
        /// Alert ID
        alert_id: String,

        /// New status (acknowledged, resolved, dismissed)
        status: String,

        /// Recorded as the acknowledging user
        #[arg(long)]
        actor: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["warden", "doctor"]);
        assert!(matches!(cli.command, Command::Doctor));
        assert!(!cli.json);
        assert!(cli.log.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["warden", "--json", "--log", "debug", "detect"]);
        assert!(cli.json);
        assert_eq!(cli.log, Some("debug".to_string()));
    }

    #[test]
    fn test_sign_key_conflicts_with_generate() {
        let result = Cli::try_parse_from([
            "warden",
            "sign",
            "com.example.a",
            "--key",
            "k.key",
            "--generate",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_audit_filters() {
        let cli = Cli::parse_from([
            "warden",
            "audit",
            "--plugin",
            "com.example.a",
            "--event",
            "plugin_error",
            "--limit",
            "5",
        ]);
        if let Command::Audit { query } = cli.command {
            assert_eq!(query.plugin.as_deref(), Some("com.example.a"));
            assert_eq!(query.event_type.as_deref(), Some("plugin_error"));
            assert_eq!(query.limit, 5);
            assert_eq!(query.page, 1);
            assert!(!query.asc);
        } else {
            panic!("Expected Audit command");
        }
    }

    #[test]
    fn test_alert_update() {
        let cli = Cli::parse_from([
            "warden",
            "alerts",
            "update",
            "abc",
            "acknowledged",
            "--actor",
            "ops",
        ]);
        if let Command::Alerts {
            action:
                AlertAction::Update {
                    alert_id,
                    status,
                    actor,
                },
        } = cli.command
        {
            assert_eq!(alert_id, "abc");
            assert_eq!(status, "acknowledged");
            assert_eq!(actor.as_deref(), Some("ops"));
        } else {
            panic!("Expected Alerts update");
        }
    }
}
