//! Flotilla - fleet-wide image distribution
//!
//! This is the main CLI entry point. `run` drives a distribution from the
//! seed host; `agent` and `agent-cleanup` are launched on target hosts.

use clap::{Parser, Subcommand};
use flotilla::config::FleetConfig;
use flotilla::error::Result;
use flotilla::fleet::{
    AgentDispatcher, Destination, FleetOrchestrator, LocalDispatcher, RoutingDispatcher,
    RunRequest, SshDispatcher,
};
use flotilla::integrity::{IntegrityVerifier, Verification};
use flotilla::manifest::{self, ArtifactId, Checksum};
use flotilla::node::{NodeAgent, NodeTransferJob};
use flotilla::swarm::{PublishRequest, SwarmCoordinator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Flotilla - peer-to-peer image distribution across a fleet
#[derive(Parser)]
#[command(name = "flotilla")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Distribute disk images to a fleet over a peer-to-peer swarm", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Fleet configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Distribute an artifact to a host group
    Run {
        /// Artifact ID
        #[arg(long)]
        artifact: String,
        /// Expected SHA-256 of the artifact
        #[arg(long)]
        checksum: String,
        /// Host the tracker and seeder run on, as reachable by the targets
        #[arg(long)]
        seed_host: String,
        /// Host group name, or a comma-separated host list
        #[arg(long)]
        targets: String,
        /// Per-node timeout in seconds
        #[arg(long)]
        per_node_timeout: Option<u64>,
        /// Global run timeout in seconds
        #[arg(long)]
        global_timeout: Option<u64>,
        /// Source image on the seed host (defaults to <image_dir>/<artifact>)
        #[arg(long)]
        source: Option<PathBuf>,
        /// Destination path on the targets
        #[arg(long)]
        dest: Option<PathBuf>,
        /// Convert the image to this format on the targets
        #[arg(long)]
        target_format: Option<String>,
    },

    /// Run a transfer job on this host and print the job report
    Agent {
        /// Manifest URI
        #[arg(long)]
        manifest_uri: String,
        /// Destination path
        #[arg(long)]
        dest: PathBuf,
        /// Convert the image to this format
        #[arg(long)]
        target_format: Option<String>,
    },

    /// Stop an abandoned agent and remove the transient state it left
    AgentCleanup {
        /// Manifest URI
        #[arg(long)]
        manifest_uri: String,
        /// Destination path
        #[arg(long)]
        dest: PathBuf,
    },

    /// Verify a file against a checksum
    Verify {
        /// File to check
        path: PathBuf,
        /// Expected SHA-256
        #[arg(long)]
        checksum: String,
    },

    /// Stop tracker and seeder processes left behind by an earlier run
    Reclaim {
        /// Artifact ID
        #[arg(long)]
        artifact: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // Agents report on stdout, so all logging goes to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn execute(cli: Cli) -> Result<i32> {
    let config = FleetConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            artifact,
            checksum,
            seed_host,
            targets,
            per_node_timeout,
            global_timeout,
            source,
            dest,
            target_format,
        } => {
            let artifact_id = ArtifactId::new(artifact)?;
            let checksum = Checksum::parse(&checksum)?;
            let targets = config.resolve_targets(&targets)?;
            let source =
                source.unwrap_or_else(|| config.swarm.image_dir.join(artifact_id.as_str()));
            let target_format = target_format.or_else(|| config.node.target_format.clone());

            let coordinator = Arc::new(SwarmCoordinator::new(&config, &seed_host)?);
            let dispatcher = build_dispatcher(&config, &targets, target_format.clone())?;
            let orchestrator = FleetOrchestrator::new(coordinator.clone(), dispatcher);

            let request = RunRequest {
                publish: PublishRequest {
                    artifact_id: artifact_id.clone(),
                    checksum: Some(checksum),
                    source_path: source,
                    source_format: None,
                },
                targets,
                destination: Destination {
                    dest_dir: config.node.dest_dir.clone(),
                    path: dest,
                    target_format,
                },
                per_node_timeout: Duration::from_secs(
                    per_node_timeout.unwrap_or(config.per_node_timeout_secs),
                ),
                global_timeout: Duration::from_secs(
                    global_timeout.unwrap_or(config.global_timeout_secs),
                ),
            };

            tokio::select! {
                result = orchestrator.run(request) => {
                    let result = result?;
                    print!("{}", result.render_table());
                    Ok(result.exit_code())
                }
                _ = shutdown_signal() => {
                    warn!(artifact = %artifact_id, "interrupted, tearing down swarm");
                    coordinator.teardown(&artifact_id).await;
                    warn!("target hosts may need `flotilla agent-cleanup`");
                    Ok(1)
                }
            }
        }

        Commands::Agent {
            manifest_uri,
            dest,
            target_format,
        } => {
            let agent = NodeAgent::from_config(&config)?.with_target_format(target_format);
            let manifest = manifest::load(&manifest_uri).await?;
            let host = gethostname::gethostname().to_string_lossy().to_string();
            let _claim = agent.claim(&dest)?;

            let mut job = NodeTransferJob::new(&host, manifest, &manifest_uri, dest);
            let interrupted = tokio::select! {
                _ = agent.run(&mut job) => false,
                _ = shutdown_signal() => true,
            };
            if interrupted {
                // Dropping the run stopped the transfer tool
                warn!(dest = %job.local_dest_path.display(), "interrupted, cleaning up");
                agent.cleanup(&job.manifest, &job.local_dest_path).await?;
                return Ok(1);
            }

            println!("{}", serde_json::to_string(&job)?);
            Ok(if job.is_done() { 0 } else { 1 })
        }

        Commands::AgentCleanup { manifest_uri, dest } => {
            let agent = NodeAgent::from_config(&config)?;
            let manifest = manifest::load(&manifest_uri).await?;
            agent.cleanup(&manifest, &dest).await?;
            info!(dest = %dest.display(), "transient state removed");
            Ok(0)
        }

        Commands::Verify { path, checksum } => {
            let expected = Checksum::parse(&checksum)?;
            match IntegrityVerifier::new().verify(&path, &expected)? {
                Verification::Valid => {
                    println!("{}: OK", path.display());
                    Ok(0)
                }
                Verification::Mismatch { actual } => {
                    println!("{}: MISMATCH (actual {})", path.display(), actual);
                    Ok(1)
                }
            }
        }

        Commands::Reclaim { artifact } => {
            let artifact_id = ArtifactId::new(artifact)?;
            let host = gethostname::gethostname().to_string_lossy().to_string();
            let coordinator = SwarmCoordinator::new(&config, &host)?;
            let stopped = coordinator.reclaim(&artifact_id).await?;
            println!("Reclaimed {} process(es) for {}", stopped, artifact_id);
            Ok(0)
        }
    }
}

/// In-process agent for configured local hosts, remote shell for the rest
fn build_dispatcher(
    config: &FleetConfig,
    targets: &[String],
    target_format: Option<String>,
) -> Result<Arc<dyn AgentDispatcher>> {
    let local_hosts = config.remote.local_hosts.clone();
    let local: Option<Arc<dyn AgentDispatcher>> =
        if targets.iter().any(|t| local_hosts.contains(t)) {
            let agent = NodeAgent::from_config(config)?.with_target_format(target_format.clone());
            Some(Arc::new(LocalDispatcher::new(Arc::new(agent))))
        } else {
            None
        };
    let remote = Arc::new(SshDispatcher::new(config.remote.clone(), target_format));

    Ok(Arc::new(RoutingDispatcher::new(local_hosts, local, remote)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}
