use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conclave_core::{ProviderKind, ProviderSelector, ProviderStatus};
use conclave_scheduler::{BackgroundTask, BackgroundTaskRunner, TaskKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::ConclaveConfig;

#[derive(Parser)]
#[command(name = "conclave")]
#[command(version)]
#[command(about = "Conclave: agent dispatch for multi-agent channels")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Show current configuration (secrets masked)
    Config,

    /// Probe every provider kind and show which one would be selected
    Providers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins when set
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Providers => cmd_providers(&cli.config).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        tokio::fs::write(&config_path, config::DEFAULT_CONFIG)
            .await
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("Conclave initialized at {}", config_dir.display());
    println!("Edit {} to configure providers and task limits.", config_path.display());
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ConclaveConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg.redacted())?);
    Ok(())
}

/// Result of a provider sweep, carried through the task runner as JSON
#[derive(Debug, Serialize, Deserialize)]
struct ProviderSweep {
    statuses: Vec<ProviderStatus>,
    selected: Option<ProviderKind>,
}

async fn cmd_providers(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ConclaveConfig::load(config_path)?;
    let selector = Arc::new(ProviderSelector::new(cfg.providers.to_selector_config()));
    let runner = BackgroundTaskRunner::with_config(cfg.tasks.to_runner_config());

    let sweep = BackgroundTask::new("provider-sweep", TaskKind::Maintenance, move |ctx| {
        async move {
            let total = ProviderKind::ALL.len() as u64;
            ctx.report_progress("probe", 0, total, None);
            let statuses = selector.check_availability().await;
            ctx.report_progress("probe", total, total, None);
            let selected = selector.preferred_provider_kind().await;
            let value = serde_json::to_value(ProviderSweep { statuses, selected })?;
            Ok::<_, anyhow::Error>(value)
        }
    });

    let result = runner
        .submit_and_wait(sweep, None)
        .await
        .context("Provider sweep failed")?;
    let output = result.output.context("Provider sweep returned no output")?;
    let sweep: ProviderSweep = serde_json::from_value(output)?;

    println!(
        "{:<10} {:<6} {:<11} {:<10} {}",
        "KIND", "LOCAL", "CONFIGURED", "AVAILABLE", "PREFERRED"
    );
    for status in &sweep.statuses {
        println!(
            "{:<10} {:<6} {:<11} {:<10} {}",
            status.kind.name(),
            yes_no(status.is_local),
            yes_no(status.configured),
            yes_no(status.available),
            yes_no(status.preferred)
        );
    }
    match sweep.selected {
        Some(kind) => println!("\nSelected provider: {}", kind),
        None => println!("\nNo provider available"),
    }
    Ok(())
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}
