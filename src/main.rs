//! Corral Control-Plane Daemon
//!
//! Loads the node configuration, opens the membership database, wires the
//! coordinator and serves the cluster API.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use corral::api::ApiServer;
use corral::config::CorralConfig;
use corral::error::{Error, Result};
use corral::membership::MembershipCoordinator;
use corral::ops::OpsRegistry;
use corral::store::{MembershipDb, StandaloneStore};
use corral::transport::{PeerClient, PeerTransport};
use corral::trust::TrustManager;
use corral::workload::NullWorkload;

/// Corral - Clustered control-plane membership daemon
#[derive(Parser)]
#[command(name = "corrald")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "corral.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Corral daemon
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "corral.toml")]
        output: PathBuf,

        /// Server name
        #[arg(long, default_value = "node-1")]
        name: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, name } => run_init(output, name),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Peer transport placeholder for deployments without an RPC layer wired
/// in. Every connection attempt fails as unreachable, which keeps the
/// standalone and bootstrap paths fully working.
struct UnwiredTransport;

#[async_trait]
impl PeerTransport for UnwiredTransport {
    async fn connect(&self, address: &str) -> Result<Arc<dyn PeerClient>> {
        Err(Error::PeerUnreachable {
            address: address.to_string(),
            reason: "no peer transport configured".into(),
        })
    }

    async fn probe(&self, _address: &str) -> bool {
        false
    }
}

/// Start the Corral daemon
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting Corral daemon...");

    let config = match CorralConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for server: {}", config.node.name);

    std::fs::create_dir_all(config.data_dir())?;

    let db = Arc::new(MembershipDb::open(&config.database_path())?);
    let ops = Arc::new(OpsRegistry::new());
    let trust = Arc::new(TrustManager::new(
        config.data_dir(),
        Arc::clone(&db),
        Arc::clone(&ops),
    ));
    trust.rebuild_cache().await?;

    let raft = Arc::new(StandaloneStore::new(
        config.cluster_address(),
        Arc::clone(&db),
    ));

    let coordinator = MembershipCoordinator::new(
        config.clone(),
        Arc::clone(&db),
        raft,
        Arc::new(UnwiredTransport),
        trust,
        Arc::new(NullWorkload),
        ops,
    );

    // A node that was already clustered resumes its cluster tasks.
    if db.is_clustered().await? {
        tracing::info!("Resuming cluster membership");
        coordinator.start_cluster_tasks().await;
    }

    if !config.api.enabled {
        tracing::warn!("HTTP API disabled, nothing to serve");
        tokio::signal::ctrl_c().await?;
        return Ok(());
    }

    let server = ApiServer::new(config.api.bind_address.clone(), Arc::clone(&coordinator));

    tokio::select! {
        result = server.start() => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    // Give our raft roles away before going down, if we hold any.
    if coordinator.db().await.is_clustered().await? {
        if let Err(e) = coordinator.handover_own_role().await {
            tracing::warn!("Failed to hand over member role on shutdown: {}", e);
        }
    }
    coordinator.stop_cluster_tasks().await;

    tracing::info!("Corral shutdown complete");
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, name: String) -> Result<()> {
    let config_content = format!(
        r#"# Corral Configuration

[node]
name = "{name}"
core_address = "0.0.0.0:8443"
# cluster_address = "10.0.0.1:8443"
data_dir = "/var/lib/corral"
# failure_domain = "rack1"

[cluster]
heartbeat_interval_secs = 10
rebalance_interval_secs = 30
rpc_timeout_secs = 30

[api]
enabled = true
bind_address = "0.0.0.0:8443"

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file, then start with: corrald start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match CorralConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  Server name:     {}", config.node.name);
            println!("  Core address:    {}", config.node.core_address);
            println!("  Cluster address: {}", config.cluster_address());
            println!("  Data directory:  {}", config.data_dir().display());
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {e}");
            Err(e)
        }
    }
}
