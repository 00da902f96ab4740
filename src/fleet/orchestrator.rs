//! Fleet orchestrator - publishes, fans out to node agents, tears down

use super::dispatch::AgentDispatcher;
use super::report::FleetRunResult;
use crate::error::{FlotillaError, Result};
use crate::manifest::Manifest;
use crate::node::{Failure, FailureKind, NodeTransferJob};
use crate::swarm::{PublishRequest, SwarmControl};
use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Upper bound on cleaning one node after its agent was cancelled
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Where promoted images land on the target hosts
#[derive(Debug, Clone)]
pub struct Destination {
    /// Directory used when no explicit path is given
    pub dest_dir: PathBuf,
    /// Explicit destination path
    pub path: Option<PathBuf>,
    /// Format images are converted to on the nodes
    pub target_format: Option<String>,
}

impl Destination {
    /// Destination path for a manifest.
    ///
    /// Without an explicit path the image is named after the artifact, with
    /// the target format (or the source format) as extension.
    pub fn resolve(&self, manifest: &Manifest) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        match self.target_format.as_ref().or(manifest.source_format.as_ref()) {
            Some(format) => self
                .dest_dir
                .join(format!("{}.{}", manifest.artifact_id, format)),
            None => self.dest_dir.join(manifest.file_name()),
        }
    }
}

/// Parameters of one fleet run
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Artifact to publish
    pub publish: PublishRequest,
    /// Target hosts
    pub targets: Vec<String>,
    /// Destination on the target hosts
    pub destination: Destination,
    /// Bound on each node's job
    pub per_node_timeout: Duration,
    /// Bound on the whole run
    pub global_timeout: Duration,
}

/// Fleet orchestrator
pub struct FleetOrchestrator {
    swarm: Arc<dyn SwarmControl>,
    dispatcher: Arc<dyn AgentDispatcher>,
}

impl FleetOrchestrator {
    /// Create a new orchestrator
    pub fn new(swarm: Arc<dyn SwarmControl>, dispatcher: Arc<dyn AgentDispatcher>) -> Self {
        Self { swarm, dispatcher }
    }

    /// Distribute an artifact to every target host.
    ///
    /// Publication and seeding errors abort the run before any dispatch.
    /// Once seeding has started, per-node failures are recorded in the
    /// result and the swarm is torn down exactly once.
    pub async fn run(&self, request: RunRequest) -> Result<FleetRunResult> {
        let targets = dedup(request.targets);
        if targets.is_empty() {
            return Err(FlotillaError::Config("no target hosts".to_string()));
        }

        let started_at = Utc::now();
        let deadline = Instant::now() + request.global_timeout;
        let artifact = request.publish.artifact_id.clone();

        let manifest = self.swarm.publish(request.publish).await?;
        let session = match self.swarm.start_seeding(&manifest).await {
            Ok(session) => session,
            Err(e) => {
                error!(artifact = %artifact, "failed to start seeding: {}", e);
                self.swarm.teardown(&artifact).await;
                return Err(e);
            }
        };

        let dest = request.destination.resolve(&manifest);
        info!(
            artifact = %artifact,
            hosts = targets.len(),
            dest = %dest.display(),
            "dispatching transfer jobs"
        );

        let uri = &session.manifest_uri;
        let mut jobs: BTreeMap<String, NodeTransferJob> = targets
            .iter()
            .map(|host| {
                let job = NodeTransferJob::new(host, manifest.clone(), uri, dest.clone());
                (host.clone(), job)
            })
            .collect();

        let mut tasks = JoinSet::new();
        for job in jobs.values() {
            tasks.spawn(run_node(
                self.dispatcher.clone(),
                job.clone(),
                request.per_node_timeout,
            ));
        }

        let mut deadline_hit = false;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(job))) => {
                    jobs.insert(job.target_host.clone(), job);
                }
                Ok(Some(Err(e))) => {
                    error!(artifact = %artifact, "node task failed: {}", e);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        artifact = %artifact,
                        remaining = tasks.len(),
                        "global deadline reached, cancelling remaining jobs"
                    );
                    deadline_hit = true;
                    break;
                }
            }
        }
        // Cancelled agents must be stopped before their state is cleaned
        tasks.shutdown().await;

        let (kind, message) = if deadline_hit {
            (
                FailureKind::Timeout,
                format!(
                    "global deadline of {}s reached",
                    request.global_timeout.as_secs()
                ),
            )
        } else {
            (FailureKind::Internal, "node task aborted".to_string())
        };
        let unresolved: Vec<&mut NodeTransferJob> = jobs
            .values_mut()
            .filter(|job| !job.is_terminal())
            .collect();
        let cleanups = unresolved
            .iter()
            .map(|job| cleanup_node(self.dispatcher.as_ref(), &**job));
        join_all(cleanups).await;
        for job in unresolved {
            job.force_fail(Failure::new(kind, message.clone()));
        }

        self.swarm.teardown(&artifact).await;

        let result = FleetRunResult {
            run_id: Uuid::new_v4().to_string(),
            artifact_id: artifact,
            jobs,
            torn_down: true,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            artifact = %result.artifact_id,
            failed = result.failed_hosts().len(),
            "fleet run finished"
        );
        Ok(result)
    }
}

async fn run_node(
    dispatcher: Arc<dyn AgentDispatcher>,
    job: NodeTransferJob,
    timeout: Duration,
) -> NodeTransferJob {
    let pending = job.clone();
    match tokio::time::timeout(timeout, dispatcher.dispatch(job)).await {
        Ok(job) => job,
        Err(_) => {
            let mut job = pending;
            warn!(host = %job.target_host, "job exceeded {}s", timeout.as_secs_f64());
            cleanup_node(dispatcher.as_ref(), &job).await;
            job.force_fail(Failure::new(
                FailureKind::Timeout,
                format!("no result within {}s", timeout.as_secs_f64()),
            ));
            job
        }
    }
}

async fn cleanup_node(dispatcher: &dyn AgentDispatcher, job: &NodeTransferJob) {
    match tokio::time::timeout(CLEANUP_TIMEOUT, dispatcher.cleanup(job)).await {
        Ok(Ok(())) => info!(host = %job.target_host, "cleaned up cancelled job"),
        Ok(Err(e)) => warn!(host = %job.target_host, "cleanup failed: {}", e),
        Err(_) => warn!(host = %job.target_host, "cleanup timed out"),
    }
}

fn dedup(hosts: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    hosts
        .into_iter()
        .map(|host| host.trim().to_string())
        .filter(|host| !host.is_empty() && seen.insert(host.clone()))
        .collect()
}
