// Warden plugin security engine
// Main entry point for the warden binary

use clap::Parser;
use warden_engine::cli::{Cli, Command};
use warden_engine::config::Config;
use warden_engine::handlers::{
    handle_alerts, handle_audit, handle_detect, handle_doctor, handle_keygen, handle_load,
    handle_monitor, handle_sign, handle_validate, handle_verify, OutputFormat,
};
use warden_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config file; RUST_LOG wins over both
    match cli.log.as_deref() {
        Some(level) => init_telemetry_with_level(level),
        None => init_telemetry_with_level(&config.core.log_level),
    }

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("Warden v{} ({} - {})", version, commit, timestamp);

    match cli.command {
        Command::Keygen {
            algorithm,
            out,
            name,
        } => handle_keygen(&algorithm, out.as_deref(), &name, format).await,

        Command::Sign {
            plugin_id,
            key,
            algorithm,
            generate,
        } => handle_sign(&plugin_id, key.as_deref(), &algorithm, generate, &config, format).await,

        Command::Verify { plugin_id, user } => {
            handle_verify(&plugin_id, user.as_deref(), &config, format).await
        }

        Command::Validate { plugin_id } => handle_validate(&plugin_id, &config, format).await,

        Command::Load {
            plugin_id,
            disabled,
            require_signature,
        } => handle_load(&plugin_id, disabled, require_signature, &config, format).await,

        Command::Audit { query } => handle_audit(&query, &config, format).await,

        Command::Alerts { action } => handle_alerts(&action, &config, format).await,

        Command::Detect => handle_detect(&config, format).await,

        Command::Monitor { interval } => {
            tracing::info!("Starting anomaly monitor...");
            handle_monitor(interval, &config).await
        }

        Command::Doctor => {
            if let OutputFormat::Text = format {
                println!("Warden v{} ({} - {})", version, commit, timestamp);
            }
            handle_doctor(&config, format).await
        }
    }
}
