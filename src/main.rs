//! rune-node - per-node convergence agent
//!
//! This is the CLI entry point for the agent.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rune_node::config::{report, AgentConfig, ConfigParser};
use rune_node::convergence::{Collector, ConvergenceAgent, Drivers};
use rune_node::driver::{FilesystemVolumeDriver, LocalContainerDriver};
use rune_node::handoff::{HandoffReceiver, HttpTransport, TransferServer};
use rune_node::model::NodeId;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// rune-node - converge a node towards its desired applications
#[derive(Parser)]
#[command(name = "rune-node")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Per-node convergence agent for Rune deployments", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Agent settings file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge this node towards the desired deployment
    #[command(name = "changestate")]
    ChangeState {
        /// Deployment configuration file
        deployment: PathBuf,
        /// Application configuration file
        application: PathBuf,
        /// Current cluster state file
        current: PathBuf,
        /// Hostname of this node
        hostname: String,
        /// Print the plan without executing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Print this node's state report
    #[command(name = "reportstate")]
    ReportState,

    /// Run the volume transfer endpoint
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = load_config(&cli)?;

    let volumes = Arc::new(
        FilesystemVolumeDriver::new(config.volumes_dir())
            .context("Failed to open volume storage")?,
    );

    match cli.command {
        Commands::ChangeState {
            deployment,
            application,
            current,
            hostname,
            dry_run,
        } => {
            config.hostname = hostname;

            let desired = ConfigParser::parse_deployment_files(&deployment, &application)
                .context("Invalid desired configuration")?;
            let current = ConfigParser::parse_current_file(&current)
                .context("Invalid current cluster state")?;

            let drivers = Drivers {
                containers: Arc::new(
                    LocalContainerDriver::new(config.state_dir())
                        .context("Failed to open unit records")?,
                ),
                volumes,
                transport: Arc::new(HttpTransport::new(config.transfer_port)),
            };
            let agent = ConvergenceAgent::new(
                NodeId::new(&config.hostname),
                drivers,
                config.executor_config(),
            );

            if dry_run {
                let plan = agent.plan(&desired, &current).await?;
                println!("{}", serde_json::to_string_pretty(&plan)?);
                return Ok(());
            }

            let report = agent.converge(&desired, &current).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if !report.blocked.is_empty() {
                warn!(
                    "{} volume(s) are claimed by several nodes and need attention",
                    report.blocked.len()
                );
            }
            if !report.is_success() {
                bail!(
                    "Node {} did not fully converge: {} action(s) failed or skipped, {} volume(s) blocked",
                    config.hostname,
                    report.failures().count(),
                    report.blocked.len()
                );
            }
        }

        Commands::ReportState => {
            let containers = Arc::new(
                LocalContainerDriver::new(config.state_dir())
                    .context("Failed to open unit records")?,
            );
            let collector = Collector::new(
                NodeId::new(&config.hostname),
                &config.namespace,
                containers,
                volumes,
            );
            let state = collector.collect()?;
            print!("{}", report(&state)?);
        }

        Commands::Serve { port } => {
            if let Some(port) = port {
                config.transfer_port = port;
            }

            let receiver = Arc::new(HandoffReceiver::new(
                NodeId::new(&config.hostname),
                volumes,
            ));
            let addr = SocketAddr::from(([0, 0, 0, 0], config.transfer_port));
            let server = TransferServer::bind(addr, receiver, config.max_transfer_bytes)
                .await
                .with_context(|| format!("Failed to bind transfer endpoint on {}", addr))?;

            server
                .run_until(async {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Shutting down");
                })
                .await?;
        }
    }

    Ok(())
}
