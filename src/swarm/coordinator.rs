//! Swarm coordinator - seed-side lifecycle of published artifacts

use super::daemon::{self, DaemonProcess, Launch};
use super::session::{SessionLease, SessionState, SwarmSession};
use crate::config::{FleetConfig, SwarmSettings};
use crate::error::{FlotillaError, Result};
use crate::exec::{self, CommandTemplate};
use crate::integrity::IntegrityVerifier;
use crate::manifest::{ArtifactId, Checksum, Manifest, ManifestStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Image formats recognised from a source file extension
const KNOWN_FORMATS: &[&str] = &["qcow2", "raw", "vmdk", "vdi", "vhdx", "vpc"];

/// Artifact to publish
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub artifact_id: ArtifactId,
    /// Expected checksum; computed from the source when absent
    pub checksum: Option<Checksum>,
    pub source_path: PathBuf,
    /// Container format; inferred from the file extension when absent
    pub source_format: Option<String>,
}

/// Seed-side swarm operations the fleet orchestrator depends on
#[async_trait]
pub trait SwarmControl: Send + Sync {
    /// Publish the manifest for an artifact
    async fn publish(&self, request: PublishRequest) -> Result<Manifest>;

    /// Start the tracker and seeder for a published manifest
    async fn start_seeding(&self, manifest: &Manifest) -> Result<SwarmSession>;

    /// Stop everything started for an artifact. Never fails.
    async fn teardown(&self, artifact: &ArtifactId);
}

/// Swarm coordinator
pub struct SwarmCoordinator {
    settings: SwarmSettings,
    seed_host: String,
    manifests: ManifestStore,
    make_descriptor: Option<CommandTemplate>,
    tracker: DaemonProcess,
    seeder: DaemonProcess,
    verifier: IntegrityVerifier,
    sessions: Arc<RwLock<HashMap<ArtifactId, SwarmSession>>>,
}

impl SwarmCoordinator {
    /// Create a coordinator for the given seed host
    pub fn new(config: &FleetConfig, seed_host: &str) -> Result<Self> {
        let settings = config.swarm.clone();
        let grace = Duration::from_secs(settings.stop_grace_secs);
        let startup = Duration::from_secs(settings.startup_timeout_secs);
        std::fs::create_dir_all(&settings.state_dir)?;

        Ok(Self {
            manifests: ManifestStore::new(
                settings.publish_dir.clone(),
                settings.publish_base_url.clone(),
            )?,
            seed_host: seed_host.to_string(),
            make_descriptor: config.tools.make_descriptor.clone(),
            tracker: DaemonProcess::new(
                "tracker",
                config.tools.tracker.clone(),
                settings.state_dir.clone(),
                grace,
            )
            .with_startup(startup, settings.await_port),
            seeder: DaemonProcess::new(
                "seeder",
                config.tools.seeder.clone(),
                settings.state_dir.clone(),
                grace,
            )
            .with_startup(startup, settings.await_port),
            verifier: IntegrityVerifier::new(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            settings,
        })
    }

    /// Tracker `host:port`
    pub fn tracker_address(&self) -> String {
        format!("{}:{}", self.seed_host, self.settings.tracker_port)
    }

    fn announce(&self) -> String {
        format!("http://{}/announce", self.tracker_address())
    }

    fn descriptor_path(&self, artifact: &ArtifactId) -> PathBuf {
        self.manifests
            .publish_dir()
            .join(format!("{}.torrent", artifact))
    }

    fn ensure_not_live(&self, artifact: &ArtifactId) -> Result<()> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| FlotillaError::Lock("Failed to acquire read lock".to_string()))?;

        if let Some(session) = sessions.get(artifact) {
            if session.is_live() {
                return Err(FlotillaError::Conflict(format!(
                    "{} ({})",
                    artifact, session.state
                )));
            }
        }
        drop(sessions);

        // Sessions run by other processes on this seed host
        match SessionLease::read(&self.settings.state_dir, artifact)? {
            Some(lease) if lease.is_held() => Err(FlotillaError::Conflict(format!(
                "{} (session {} in pid {})",
                artifact, lease.session_id, lease.owner.pid
            ))),
            _ => Ok(()),
        }
    }

    fn release_lease(&self, artifact: &ArtifactId, session_id: &str) {
        if let Err(e) = SessionLease::release(&self.settings.state_dir, artifact, session_id) {
            warn!(artifact = %artifact, "failed to release session lease: {}", e);
        }
    }

    fn remove_session(&self, artifact: &ArtifactId) {
        match self.sessions.write() {
            Ok(mut sessions) => {
                sessions.remove(artifact);
            }
            Err(_) => warn!(artifact = %artifact, "Failed to acquire write lock"),
        }
    }

    /// Publish a manifest for an artifact.
    ///
    /// Fails with a conflict while a previous session for the same artifact
    /// has not reached [`SessionState::Closed`], whether that session runs
    /// in this process or in another one on the seed host.
    pub async fn publish(&self, request: PublishRequest) -> Result<Manifest> {
        let artifact = request.artifact_id.clone();
        self.ensure_not_live(&artifact)?;

        let metadata = std::fs::metadata(&request.source_path).map_err(|e| {
            FlotillaError::Config(format!(
                "cannot read source {}: {}",
                request.source_path.display(),
                e
            ))
        })?;

        let checksum = match request.checksum {
            Some(checksum) => checksum,
            None => {
                info!(
                    artifact = %artifact,
                    "computing checksum of {}",
                    request.source_path.display()
                );
                let verifier = self.verifier;
                let path = request.source_path.clone();
                tokio::task::spawn_blocking(move || verifier.checksum(&path))
                    .await
                    .map_err(|e| FlotillaError::Internal(e.to_string()))??
            }
        };

        let descriptor_path = self.descriptor_path(&artifact);
        let descriptor = self.make_descriptor.as_ref().map(|_| {
            let file_name = format!("{}.torrent", artifact);
            self.manifests.uri_for_file(&file_name)
        });

        let manifest = Manifest {
            artifact_id: artifact.clone(),
            checksum,
            source_path: request.source_path.clone(),
            announce: self.announce(),
            size: metadata.len(),
            source_format: request
                .source_format
                .or_else(|| infer_format(&request.source_path)),
            descriptor,
            created_at: Utc::now(),
        };
        let manifest_uri = self.manifests.uri_for(&artifact);

        // Reserve the artifact id before touching the publish directory
        let session = SwarmSession::new(manifest.clone(), manifest_uri, self.tracker_address());
        let session_id = session.id.clone();
        {
            let mut sessions = self
                .sessions
                .write()
                .map_err(|_| FlotillaError::Lock("Failed to acquire write lock".to_string()))?;
            if let Some(existing) = sessions.get(&artifact) {
                if existing.is_live() {
                    return Err(FlotillaError::Conflict(format!(
                        "{} ({})",
                        artifact, existing.state
                    )));
                }
            }
            sessions.insert(artifact.clone(), session);
        }
        if let Err(e) = SessionLease::acquire(&self.settings.state_dir, &artifact, &session_id) {
            self.remove_session(&artifact);
            return Err(e);
        }

        if let Err(e) = self.write_publication(&manifest, &descriptor_path).await {
            self.remove_session(&artifact);
            self.release_lease(&artifact, &session_id);
            return Err(e);
        }

        info!(artifact = %artifact, checksum = %manifest.checksum, "manifest published");
        Ok(manifest)
    }

    async fn write_publication(&self, manifest: &Manifest, descriptor_path: &Path) -> Result<()> {
        if let Some(template) = &self.make_descriptor {
            // Tools like mktorrent refuse to overwrite an existing descriptor
            remove_if_exists(descriptor_path)?;

            let source = manifest.source_path.to_string_lossy();
            let descriptor = descriptor_path.to_string_lossy();
            let argv = template.render(&[
                ("source", &source),
                ("announce", &manifest.announce),
                ("descriptor", &descriptor),
                ("artifact", manifest.artifact_id.as_str()),
            ])?;
            let output = exec::run(&argv).await?;
            if !output.success() {
                return Err(FlotillaError::Startup(format!(
                    "descriptor creation failed with {}",
                    output.describe()
                )));
            }
        }

        self.manifests.write(manifest)?;
        Ok(())
    }

    /// Start the tracker and seeder for a published manifest.
    ///
    /// Stale daemons recorded for the same artifact are reclaimed first; a
    /// port that is still bound afterwards is a startup error, as is a daemon
    /// that exits or never binds its port.
    pub async fn start_seeding(&self, manifest: &Manifest) -> Result<SwarmSession> {
        let artifact = &manifest.artifact_id;
        {
            let sessions = self
                .sessions
                .read()
                .map_err(|_| FlotillaError::Lock("Failed to acquire read lock".to_string()))?;
            let session = sessions
                .get(artifact)
                .ok_or_else(|| FlotillaError::SessionNotFound(artifact.to_string()))?;
            if session.state != SessionState::Publishing {
                return Err(FlotillaError::Startup(format!(
                    "session for {} is {}, expected publishing",
                    artifact, session.state
                )));
            }
        }

        self.reclaim_processes(artifact).await?;

        for port in [self.settings.tracker_port, self.settings.seed_port] {
            if !daemon::port_available(port) {
                return Err(FlotillaError::Startup(format!(
                    "port {} is already bound",
                    port
                )));
            }
        }

        let source_dir = manifest
            .source_path
            .parent()
            .unwrap_or_else(|| Path::new("/"))
            .to_path_buf();
        let descriptor_path = self.descriptor_path(artifact);
        let descriptor = manifest
            .descriptor
            .as_ref()
            .map(|_| descriptor_path.as_path());
        let announce = manifest.announce.as_str();

        let tracker = self
            .tracker
            .start(&Launch {
                artifact,
                port: self.settings.tracker_port,
                data_dir: &self.settings.state_dir,
                source: &manifest.source_path,
                descriptor,
                announce,
            })
            .await?;

        let seeder = match self
            .seeder
            .start(&Launch {
                artifact,
                port: self.settings.seed_port,
                data_dir: &source_dir,
                source: &manifest.source_path,
                descriptor,
                announce,
            })
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(stop_err) = self.tracker.stop(artifact).await {
                    warn!(artifact = %artifact, "failed to stop tracker: {}", stop_err);
                }
                return Err(e);
            }
        };

        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| FlotillaError::Lock("Failed to acquire write lock".to_string()))?;
        let session = sessions
            .get_mut(artifact)
            .ok_or_else(|| FlotillaError::SessionNotFound(artifact.to_string()))?;
        session.tracker = Some(tracker);
        session.seeder = Some(seeder);
        session.set_state(SessionState::Seeding);

        info!(artifact = %artifact, tracker = %session.tracker_address, "seeding started");
        Ok(session.clone())
    }

    /// Stop the daemons, remove the published manifest and close the
    /// session. Idempotent; failures are logged.
    pub async fn teardown(&self, artifact: &ArtifactId) {
        let session = match self.sessions.write() {
            Ok(mut sessions) => match sessions.get_mut(artifact) {
                Some(session) if session.is_live() => {
                    session.set_state(SessionState::TearingDown);
                    Some(session.clone())
                }
                _ => None,
            },
            Err(_) => {
                warn!(artifact = %artifact, "Failed to acquire write lock");
                None
            }
        };

        let Some(session) = session else {
            debug!(artifact = %artifact, "no live session, nothing to tear down");
            return;
        };

        for daemon in [&self.seeder, &self.tracker] {
            if let Err(e) = daemon.stop(artifact).await {
                warn!(artifact = %artifact, role = daemon.role(), "failed to stop daemon: {}", e);
            }
        }

        if let Err(e) = self.manifests.remove(artifact) {
            warn!(artifact = %artifact, "failed to remove manifest: {}", e);
        }
        if session.manifest.descriptor.is_some() {
            if let Err(e) = remove_if_exists(&self.descriptor_path(artifact)) {
                warn!(artifact = %artifact, "failed to remove descriptor: {}", e);
            }
        }

        match self.sessions.write() {
            Ok(mut sessions) => {
                if let Some(session) = sessions.get_mut(artifact) {
                    session.set_state(SessionState::Closed);
                }
            }
            Err(_) => warn!(artifact = %artifact, "Failed to acquire write lock"),
        }
        self.release_lease(artifact, &session.id);
        info!(artifact = %artifact, session = %session.id, "swarm torn down");
    }

    async fn reclaim_processes(&self, artifact: &ArtifactId) -> Result<usize> {
        let mut stopped = 0;
        for daemon in [&self.seeder, &self.tracker] {
            if daemon.stop(artifact).await? {
                warn!(artifact = %artifact, role = daemon.role(), "reclaimed stale daemon");
                stopped += 1;
            }
        }
        Ok(stopped)
    }

    /// Stop daemons left behind by an earlier run for an artifact.
    ///
    /// Refuses while a running session holds the artifact. Returns how many
    /// live processes were stopped.
    pub async fn reclaim(&self, artifact: &ArtifactId) -> Result<usize> {
        self.ensure_not_live(artifact)?;

        // Hold the artifact while reclaiming so no run can publish under us
        let reclaim_id = Uuid::new_v4().to_string();
        SessionLease::acquire(&self.settings.state_dir, artifact, &reclaim_id)?;
        let result = self.reclaim_processes(artifact).await;
        let removed = self.manifests.remove(artifact);
        self.release_lease(artifact, &reclaim_id);

        if removed? {
            info!(artifact = %artifact, "removed stale manifest");
        }
        result
    }

    /// Get a session snapshot
    pub fn session(&self, artifact: &ArtifactId) -> Result<Option<SwarmSession>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| FlotillaError::Lock("Failed to acquire read lock".to_string()))?;
        Ok(sessions.get(artifact).cloned())
    }

    /// Artifact ids with a live session
    pub fn live_sessions(&self) -> Result<Vec<ArtifactId>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| FlotillaError::Lock("Failed to acquire read lock".to_string()))?;

        let mut live: Vec<ArtifactId> = sessions
            .values()
            .filter(|s| s.is_live())
            .map(|s| s.manifest.artifact_id.clone())
            .collect();
        live.sort();
        Ok(live)
    }
}

#[async_trait]
impl SwarmControl for SwarmCoordinator {
    async fn publish(&self, request: PublishRequest) -> Result<Manifest> {
        SwarmCoordinator::publish(self, request).await
    }

    async fn start_seeding(&self, manifest: &Manifest) -> Result<SwarmSession> {
        SwarmCoordinator::start_seeding(self, manifest).await
    }

    async fn teardown(&self, artifact: &ArtifactId) {
        SwarmCoordinator::teardown(self, artifact).await
    }
}

/// Guess an image format from a file extension
pub fn infer_format(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "img" => Some("raw".to_string()),
        "vhd" => Some("vpc".to_string()),
        e if KNOWN_FORMATS.contains(&e) => Some(ext),
        _ => None,
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::daemon::{is_alive, ProcessRecord};
    use std::net::TcpListener;
    use tempfile::{tempdir, TempDir};

    fn free_port() -> u16 {
        TcpListener::bind(("0.0.0.0", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn test_config(temp: &TempDir) -> FleetConfig {
        let mut config = FleetConfig::default();
        config.swarm.publish_dir = temp.path().join("published");
        config.swarm.state_dir = temp.path().join("state");
        config.swarm.image_dir = temp.path().join("images");
        config.swarm.tracker_port = free_port();
        config.swarm.seed_port = free_port();
        config.swarm.stop_grace_secs = 2;
        // `sleep` never binds the ports
        config.swarm.await_port = false;
        config.tools.make_descriptor = None;
        config.tools.tracker = CommandTemplate::new(["sleep", "30"]);
        config.tools.seeder = CommandTemplate::new(["sleep", "30"]);
        config
    }

    fn setup() -> (TempDir, SwarmCoordinator, PublishRequest) {
        let temp = tempdir().unwrap();
        let config = test_config(&temp);
        let (coordinator, request) = setup_with(&config);
        (temp, coordinator, request)
    }

    fn setup_with(config: &FleetConfig) -> (SwarmCoordinator, PublishRequest) {
        std::fs::create_dir_all(&config.swarm.image_dir).unwrap();
        let source = config.swarm.image_dir.join("img-1.qcow2");
        std::fs::write(&source, b"hello world").unwrap();

        let coordinator = SwarmCoordinator::new(config, "seed").unwrap();
        let request = PublishRequest {
            artifact_id: ArtifactId::new("img-1").unwrap(),
            checksum: None,
            source_path: source,
            source_format: None,
        };
        (coordinator, request)
    }

    #[tokio::test]
    async fn test_publish_computes_checksum() {
        let (_temp, coordinator, request) = setup();
        let manifest = coordinator.publish(request).await.unwrap();

        assert_eq!(
            manifest.checksum.as_str(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(manifest.size, 11);
        assert_eq!(manifest.source_format.as_deref(), Some("qcow2"));
        assert!(coordinator.manifests.exists(&manifest.artifact_id));
        assert_eq!(
            coordinator.session(&manifest.artifact_id).unwrap().unwrap().state,
            SessionState::Publishing
        );
    }

    #[tokio::test]
    async fn test_double_publish_conflicts() {
        let (_temp, coordinator, request) = setup();
        coordinator.publish(request.clone()).await.unwrap();

        let err = coordinator.publish(request).await.unwrap_err();
        assert!(matches!(err, FlotillaError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_seeding_lifecycle_and_reuse() {
        let (_temp, coordinator, request) = setup();
        let manifest = coordinator.publish(request.clone()).await.unwrap();

        let session = coordinator.start_seeding(&manifest).await.unwrap();
        assert_eq!(session.state, SessionState::Seeding);
        let tracker_pid = session.tracker.as_ref().unwrap().pid as i32;
        let seeder_pid = session.seeder.as_ref().unwrap().pid as i32;
        assert!(is_alive(tracker_pid));
        assert!(is_alive(seeder_pid));
        assert_eq!(coordinator.live_sessions().unwrap(), vec![manifest.artifact_id.clone()]);

        coordinator.teardown(&manifest.artifact_id).await;
        assert!(!is_alive(tracker_pid));
        assert!(!is_alive(seeder_pid));
        assert!(!coordinator.manifests.exists(&manifest.artifact_id));
        assert_eq!(
            coordinator.session(&manifest.artifact_id).unwrap().unwrap().state,
            SessionState::Closed
        );
        assert!(coordinator.live_sessions().unwrap().is_empty());

        // Idempotent
        coordinator.teardown(&manifest.artifact_id).await;

        // Closed sessions release the artifact id
        coordinator.publish(request).await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_unknown_artifact_is_noop() {
        let (_temp, coordinator, _request) = setup();
        coordinator
            .teardown(&ArtifactId::new("never-published").unwrap())
            .await;
    }

    #[tokio::test]
    async fn test_start_seeding_fails_on_bound_port() {
        let (_temp, coordinator, request) = setup();
        let listener = TcpListener::bind(("0.0.0.0", coordinator.settings.tracker_port)).unwrap();
        let manifest = coordinator.publish(request).await.unwrap();

        let err = coordinator.start_seeding(&manifest).await.unwrap_err();
        assert!(matches!(err, FlotillaError::Startup(_)));
        assert!(coordinator.tracker.recorded(&manifest.artifact_id).unwrap().is_none());

        drop(listener);
        coordinator.teardown(&manifest.artifact_id).await;
        assert!(!coordinator.manifests.exists(&manifest.artifact_id));
    }

    #[tokio::test]
    async fn test_start_seeding_reclaims_stale_daemon() {
        let (_temp, coordinator, request) = setup();
        let artifact = request.artifact_id.clone();

        let stale = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let stale_pid = stale.id() as i32;
        let record = ProcessRecord::of(stale_pid);
        std::fs::write(coordinator.seeder.pid_file(&artifact), format!("{}\n", record)).unwrap();

        let manifest = coordinator.publish(request).await.unwrap();
        coordinator.start_seeding(&manifest).await.unwrap();
        assert!(!is_alive(stale_pid));

        coordinator.teardown(&artifact).await;
    }

    #[tokio::test]
    async fn test_reclaim_refuses_live_session() {
        let (_temp, coordinator, request) = setup();
        let artifact = request.artifact_id.clone();
        coordinator.publish(request).await.unwrap();

        assert!(matches!(
            coordinator.reclaim(&artifact).await,
            Err(FlotillaError::Conflict(_))
        ));
        coordinator.teardown(&artifact).await;
        assert_eq!(coordinator.reclaim(&artifact).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_conflict_across_coordinators() {
        let temp = tempdir().unwrap();
        let config = test_config(&temp);
        let (first, request) = setup_with(&config);
        let (second, _) = setup_with(&config);
        let artifact = request.artifact_id.clone();

        let manifest = first.publish(request.clone()).await.unwrap();
        let session = first.start_seeding(&manifest).await.unwrap();
        let seeder_pid = session.seeder.as_ref().unwrap().pid as i32;

        assert!(matches!(
            second.publish(request.clone()).await,
            Err(FlotillaError::Conflict(_))
        ));
        assert!(matches!(
            second.reclaim(&artifact).await,
            Err(FlotillaError::Conflict(_))
        ));
        assert!(is_alive(seeder_pid));
        assert!(first.manifests.exists(&artifact));

        first.teardown(&artifact).await;
        assert!(!is_alive(seeder_pid));

        let manifest = second.publish(request).await.unwrap();
        second.start_seeding(&manifest).await.unwrap();
        second.teardown(&artifact).await;
    }

    #[tokio::test]
    async fn test_publish_takes_over_lease_of_exited_run() {
        let (temp, coordinator, request) = setup();
        let artifact = request.artifact_id.clone();

        let mut crashed = std::process::Command::new("true").spawn().unwrap();
        let pid = crashed.id() as i32;
        crashed.wait().unwrap();
        let lease = SessionLease {
            session_id: "crashed".to_string(),
            owner: ProcessRecord {
                pid,
                start_time: Some(1),
            },
            created_at: Utc::now(),
        };
        std::fs::write(
            SessionLease::path(&temp.path().join("state"), &artifact),
            serde_json::to_vec(&lease).unwrap(),
        )
        .unwrap();

        coordinator.publish(request).await.unwrap();
        coordinator.teardown(&artifact).await;
        assert!(SessionLease::read(&temp.path().join("state"), &artifact)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_start_seeding_fails_when_seeder_exits() {
        let temp = tempdir().unwrap();
        let mut config = test_config(&temp);
        config.tools.seeder = CommandTemplate::new(["false"]);
        let (coordinator, request) = setup_with(&config);

        let manifest = coordinator.publish(request).await.unwrap();
        let err = coordinator.start_seeding(&manifest).await.unwrap_err();
        assert!(matches!(err, FlotillaError::Startup(_)));
        assert!(coordinator.tracker.recorded(&manifest.artifact_id).unwrap().is_none());
        assert!(coordinator.seeder.recorded(&manifest.artifact_id).unwrap().is_none());

        coordinator.teardown(&manifest.artifact_id).await;
        assert!(coordinator.live_sessions().unwrap().is_empty());
    }

    #[test]
    fn test_infer_format() {
        assert_eq!(infer_format(Path::new("a.QCOW2")).as_deref(), Some("qcow2"));
        assert_eq!(infer_format(Path::new("a.img")).as_deref(), Some("raw"));
        assert_eq!(infer_format(Path::new("a.iso")), None);
        assert_eq!(infer_format(Path::new("a")), None);
    }
}
