//! hubd - alphahub relay daemon
//!
//! Receives player userinfo from game servers, records sightings and gossips
//! them to peer hubs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hub_proto::PeerRole;
use hub_relay::{HubConfig, PeerDirectory, Relay, RelayMode};
use hub_store::{OutboxBackend, Store};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_CONFIG: &str = "/etc/alphahub/hubd.toml";
const DEFAULT_FILTER: &str = "hubd=info,hub_relay=info,hub_store=info";

#[derive(Parser)]
#[command(name = "hubd")]
#[command(about = "alphahub relay daemon")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay
    Run {
        /// Path to config file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// Validate a config file and print the resolved peer directory
    CheckConfig {
        /// Path to config file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    match cli.command {
        Commands::Run { config } => run_hub(&config).await?,
        Commands::CheckConfig { config } => check_config(&config).await?,
        Commands::InitConfig { output } => init_config(&output)?,
    }

    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(DEFAULT_FILTER)?,
    };
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(())
}

async fn run_hub(config_path: &Path) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting hubd");

    let config = HubConfig::from_file(config_path)?;
    info!(
        host = %config.host,
        mode = ?config.mode,
        checksum = ?config.checksum,
        "loaded config"
    );

    let directory = PeerDirectory::resolve(config.peers()).await?;

    let store = match &config.state_dir {
        Some(dir) => Store::open(dir)
            .with_context(|| format!("failed to open store in {}", dir.display()))?,
        None => {
            // Validation only lets gossip mode get here.
            warn!("no state_dir configured, state is kept in memory only");
            Store::in_memory()
        }
    };
    let outbox: Option<Arc<dyn OutboxBackend>> = match config.mode {
        RelayMode::Failover => Some(Arc::new(store.clone())),
        RelayMode::Gossip => None,
    };

    let mut relay = Relay::start(config.settings(), directory, Arc::new(store), outbox).await?;

    tokio::select! {
        result = relay.wait() => {
            result.context("relay failed")?;
            warn!("dispatcher exited without a shutdown request");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("interrupt received, shutting down");
        }
    }

    let stats = relay.stats();
    relay.stop().await?;
    info!(?stats, "hubd stopped");
    Ok(())
}

async fn check_config(config_path: &Path) -> anyhow::Result<()> {
    let config = HubConfig::from_file(config_path)?;
    let directory = PeerDirectory::resolve(config.peers()).await?;

    println!("{} is valid", config_path.display());
    println!("  mode: {:?}, checksum: {:?}", config.mode, config.checksum);
    for role in PeerRole::ALL {
        for peer in directory.peers(role) {
            println!(
                "  {:<10} {:<24} {}:{} (sends to port {})",
                role.as_str(),
                peer.name,
                peer.address,
                peer.port,
                peer.send_port
            );
        }
    }
    Ok(())
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let toml = HubConfig::sample().to_toml()?;
    std::fs::write(output, toml).with_context(|| format!("failed to write {}", output.display()))?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the peers and secrets, then run:");
    println!("  hubd run --config {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_json_logs() {
        let cli = Cli::try_parse_from(["hubd", "run", "--config", "/tmp/hub.toml", "--json-logs"])
            .expect("parse");
        assert!(cli.json_logs);
        assert!(matches!(
            cli.command,
            Commands::Run { config } if config == Path::new("/tmp/hub.toml")
        ));
    }

    #[test]
    fn test_default_config_path() {
        let cli = Cli::try_parse_from(["hubd", "check-config"]).expect("parse");
        assert!(!cli.json_logs);
        assert!(matches!(
            cli.command,
            Commands::CheckConfig { config } if config == Path::new(DEFAULT_CONFIG)
        ));
    }

    #[test]
    fn test_init_config_writes_loadable_sample() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("hubd.toml");

        init_config(&path).expect("init config");

        let config = HubConfig::from_file(&path).expect("sample loads");
        assert_eq!(config, HubConfig::sample());
    }
}
