//! CLI commands

use anyhow::{anyhow, Result};
use clap::Subcommand;
use paf_core::{ConfigStore, Family};
use paf_daemon::{PafDaemon, Settings, StateDir};
use std::path::PathBuf;
use tracing::info;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the proxy in the foreground
    Serve,

    /// Show whether a daemon is responding on the configured web port
    Status,

    /// List configurations for a service (claude or codex)
    List {
        /// Service name
        service: String,
    },

    /// Activate a configuration
    Activate {
        /// Service name (claude or codex)
        service: String,
        /// Configuration name
        config: String,
    },
}

impl Commands {
    pub async fn execute(self, data_dir: Option<PathBuf>) -> Result<()> {
        let state_dir = StateDir::new(data_dir)?;

        match self {
            Commands::Serve => serve(state_dir).await,
            Commands::Status => status(&state_dir).await,
            Commands::List { service } => list(&state_dir, &service),
            Commands::Activate { service, config } => activate(&state_dir, &service, &config),
        }
    }
}

fn parse_family(service: &str) -> Result<Family> {
    Family::parse(service)
        .ok_or_else(|| anyhow!("unknown service '{service}' (expected claude or codex)"))
}

async fn serve(state_dir: StateDir) -> Result<()> {
    state_dir.create_directories()?;
    let settings = Settings::load_or_init(&state_dir.config_path())?;

    // the settings file may redirect the data directory
    let state_dir = match settings.data_dir.clone() {
        Some(dir) => StateDir::new(Some(dir))?,
        None => state_dir,
    };

    info!("Starting PAF services (data dir: {})", state_dir.base().display());
    let daemon = PafDaemon::new(settings, &state_dir)?;
    daemon.run().await?;
    Ok(())
}

async fn status(state_dir: &StateDir) -> Result<()> {
    let settings = Settings::load_or_init(&state_dir.config_path())?;
    let url = format!("http://127.0.0.1:{}/api/status", settings.web_port);

    match reqwest::Client::new()
        .get(&url)
        .timeout(std::time::Duration::from_secs(3))
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let uptime = body.get("uptime").and_then(|v| v.as_u64()).unwrap_or(0);
            println!("PAF is running (uptime: {uptime}s)");
            println!("  Dashboard:    http://localhost:{}", settings.web_port);
            println!("  Claude proxy: port {}", settings.claude_port);
            println!("  Codex proxy:  port {}", settings.codex_port);
        }
        _ => {
            println!("PAF is not running on port {}", settings.web_port);
            println!("Use 'paf serve' to start it.");
        }
    }
    Ok(())
}

fn list(state_dir: &StateDir, service: &str) -> Result<()> {
    let family = parse_family(service)?;
    let store = ConfigStore::open(family, state_dir.base())?;
    let state = store.snapshot();

    println!("=== {family} configurations (mode: {:?}) ===\n", state.mode);

    if state.configs.is_empty() {
        println!("  No configurations found.");
        return Ok(());
    }

    for profile in &state.configs {
        let marker = if profile.name == state.active.name {
            " [ACTIVE]"
        } else {
            ""
        };
        let flags = match (profile.enabled, profile.freeze_until.is_some()) {
            (false, _) => " (disabled)",
            (true, true) => " (frozen)",
            (true, false) => "",
        };
        println!("  {}{}{}:", profile.name, marker, flags);
        println!("    Base URL: {}", profile.base_url);
        println!("    Weight:   {}", profile.weight);
        println!();
    }
    Ok(())
}

fn activate(state_dir: &StateDir, service: &str, config: &str) -> Result<()> {
    let family = parse_family(service)?;
    let store = ConfigStore::open(family, state_dir.base())?;

    let snapshot = store.snapshot();
    let profile = snapshot
        .profile(config)
        .ok_or_else(|| anyhow!("configuration '{config}' not found"))?;
    if !profile.enabled {
        return Err(anyhow!("configuration '{config}' is disabled"));
    }

    store.mutate(|s| s.active.name = config.to_string())?;
    info!("Activated {family} configuration: {config}");
    println!("Activated {family} configuration: {config}");
    Ok(())
}
