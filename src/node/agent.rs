//! Node agent - drives one transfer job on its own host
//!
//! The agent walks a job through fetch, verify and promote strictly in
//! order. An artifact is only ever installed after the verifier returned
//! [`Verification::Valid`] for the downloaded bytes, and every failure path
//! removes the transient download and reverts the firewall allowance.
//!
//! An agent started from the command line claims its destination with a pid
//! file, so a later cleanup can stop it if the remote shell that launched it
//! went away.

use super::job::{Failure, FailureKind, NodeTransferJob};
use crate::config::{FleetConfig, PortRange};
use crate::error::{FlotillaError, Result};
use crate::host::{
    CommandConverter, CommandFirewall, CommandTransferEngine, Firewall, ImageConverter,
    LocalImageStore, Permissions, TransferEngine,
};
use crate::integrity::{IntegrityVerifier, Verification};
use crate::manifest::Manifest;
use crate::swarm::daemon::{self, ProcessRecord};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Grace period for an abandoned agent between SIGTERM and SIGKILL
const AGENT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Marks a destination as being written by this process. Released on drop.
#[derive(Debug)]
pub struct AgentClaim {
    path: PathBuf,
}

impl AgentClaim {
    /// Pid file holding the claim
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AgentClaim {
    fn drop(&mut self) {
        if let Ok(Some(record)) = read_claim(&self.path) {
            if record.is_self() {
                discard_logged(&self.path);
            }
        }
    }
}

fn read_claim(path: &Path) -> Result<Option<ProcessRecord>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(ProcessRecord::parse(&content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Agent behaviour knobs
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Peer ports opened while fetching
    pub peer_ports: PortRange,
    /// Format the local runtime expects
    pub target_format: Option<String>,
    /// Require a matching promotion stamp before skipping an existing image
    pub verify_existing: bool,
}

/// Node agent
pub struct NodeAgent {
    transfer: Arc<dyn TransferEngine>,
    firewall: Arc<dyn Firewall>,
    converter: Arc<dyn ImageConverter>,
    verifier: IntegrityVerifier,
    store: LocalImageStore,
    settings: AgentSettings,
}

impl NodeAgent {
    /// Create an agent from explicit capabilities
    pub fn new(
        transfer: Arc<dyn TransferEngine>,
        firewall: Arc<dyn Firewall>,
        converter: Arc<dyn ImageConverter>,
        store: LocalImageStore,
        settings: AgentSettings,
    ) -> Self {
        Self {
            transfer,
            firewall,
            converter,
            verifier: IntegrityVerifier::new(),
            store,
            settings,
        }
    }

    /// Create an agent driving the external tools named in the config
    pub fn from_config(config: &FleetConfig) -> Result<Self> {
        let tools = &config.tools;
        let store = LocalImageStore::new(
            config.node.staging_dir.clone(),
            Permissions {
                mode: config.node.mode,
                owner: config.node.owner,
                group: config.node.group,
            },
        )?;

        Ok(Self::new(
            Arc::new(CommandTransferEngine::new(tools.transfer.clone())),
            Arc::new(CommandFirewall::new(
                tools.firewall_check.clone(),
                tools.firewall_allow.clone(),
                tools.firewall_revoke.clone(),
            )),
            Arc::new(CommandConverter::new(tools.converter.clone())),
            store,
            AgentSettings {
                peer_ports: config.swarm.peer_ports,
                target_format: config.node.target_format.clone(),
                verify_existing: config.node.verify_existing,
            },
        ))
    }

    /// Override the target format for this agent
    pub fn with_target_format(mut self, format: Option<String>) -> Self {
        if format.is_some() {
            self.settings.target_format = format;
        }
        self
    }

    /// Run a job to a terminal state.
    ///
    /// On failure the job carries the reason and transient state has been
    /// cleaned up before this returns.
    pub async fn run(&self, job: &mut NodeTransferJob) {
        info!(
            host = %job.target_host,
            artifact = %job.manifest.artifact_id,
            dest = %job.local_dest_path.display(),
            "starting transfer job"
        );

        match self.drive(job).await {
            Ok(()) => {
                info!(host = %job.target_host, skipped = job.skipped, "transfer job done");
            }
            Err(failure) => {
                warn!(host = %job.target_host, "transfer job failed: {}", failure);
                if let Err(e) = self.cleanup(&job.manifest, &job.local_dest_path).await {
                    warn!(host = %job.target_host, "cleanup after failure incomplete: {}", e);
                }
                job.force_fail(failure);
            }
        }
    }

    async fn drive(&self, job: &mut NodeTransferJob) -> std::result::Result<(), Failure> {
        let internal = |e: FlotillaError| Failure::from_error(FailureKind::Internal, &e);
        let manifest = job.manifest.clone();
        let dest = job.local_dest_path.clone();

        if self
            .store
            .is_present(&dest, &manifest.checksum, self.settings.verify_existing)
        {
            info!(
                host = %job.target_host,
                dest = %dest.display(),
                "image already present, skipping fetch"
            );
            return job.skip().map_err(internal);
        }

        // Fetching
        job.start_fetch().map_err(internal)?;
        let staged = self.store.staging_path(&manifest);
        self.firewall
            .allow(self.settings.peer_ports)
            .await
            .map_err(|e| Failure::from_error(FailureKind::Transfer, &e))?;
        self.transfer
            .fetch(&manifest, &staged)
            .await
            .map_err(|e| Failure::from_error(FailureKind::Transfer, &e))?;

        // Verifying
        job.start_verify().map_err(internal)?;
        let verifier = self.verifier;
        let expected = manifest.checksum.clone();
        let path = staged.clone();
        let verification = tokio::task::spawn_blocking(move || verifier.verify(&path, &expected))
            .await
            .map_err(|e| Failure::new(FailureKind::Internal, e.to_string()))?;

        match verification {
            Ok(Verification::Valid) => {}
            Ok(Verification::Mismatch { actual }) => {
                discard_logged(&staged);
                return Err(Failure::new(
                    FailureKind::Integrity,
                    format!(
                        "{}: expected {}, downloaded file hashes to {}",
                        manifest.artifact_id, manifest.checksum, actual
                    ),
                ));
            }
            Err(e) => {
                discard_logged(&staged);
                return Err(Failure::new(FailureKind::Integrity, e.to_string()));
            }
        }

        // Promoting
        job.start_promote().map_err(internal)?;
        let promoted = self.promote(&manifest, &staged, &dest).await;
        discard_logged(&staged);
        promoted.map_err(|e| Failure::from_error(FailureKind::Conversion, &e))?;

        if let Err(e) = self.firewall.revoke(self.settings.peer_ports).await {
            warn!(host = %job.target_host, "failed to revoke firewall allowance: {}", e);
        }
        job.complete().map_err(internal)
    }

    async fn promote(&self, manifest: &Manifest, staged: &Path, dest: &Path) -> Result<()> {
        let conversion = match (&manifest.source_format, &self.settings.target_format) {
            (Some(from), Some(to)) if from != to => Some((from.as_str(), to.as_str())),
            (None, Some(to)) => {
                return Err(FlotillaError::Conversion(format!(
                    "cannot convert {} to {}: source format unknown",
                    manifest.artifact_id, to
                )))
            }
            _ => None,
        };

        match conversion {
            Some((from, to)) => {
                let partial = LocalImageStore::partial_path(dest);
                if let Some(parent) = partial.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                info!(artifact = %manifest.artifact_id, from, to, "converting image");
                if let Err(e) = self.converter.convert(staged, &partial, from, to).await {
                    discard_logged(&partial);
                    return Err(e);
                }
                let installed = self.store.install(&partial, dest, &manifest.checksum);
                if installed.is_err() {
                    discard_logged(&partial);
                }
                installed
            }
            None => self.store.install(staged, dest, &manifest.checksum),
        }
    }

    /// Claim `dest` for this process.
    ///
    /// Fails while another running agent holds the claim. A claim left by an
    /// agent that has exited is taken over.
    pub fn claim(&self, dest: &Path) -> Result<AgentClaim> {
        let path = LocalImageStore::claim_path(dest);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    writeln!(file, "{}", ProcessRecord::current())?;
                    return Ok(AgentClaim { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            match read_claim(&path)? {
                Some(record) if record.is_running() && !record.is_self() => {
                    return Err(FlotillaError::Lock(format!(
                        "{} is being written by agent pid {}",
                        dest.display(),
                        record.pid
                    )));
                }
                _ => {
                    LocalImageStore::discard(&path)?;
                }
            }
        }

        Err(FlotillaError::Lock(format!(
            "claim on {} is contended",
            dest.display()
        )))
    }

    /// Stop another agent process still holding the claim on `dest` and
    /// remove its claim. Returns whether a process was stopped.
    pub async fn stop_abandoned(&self, dest: &Path) -> Result<bool> {
        let path = LocalImageStore::claim_path(dest);
        let stopped = match read_claim(&path)? {
            Some(record) if record.is_self() => return Ok(false),
            Some(record) if record.is_running() => {
                warn!(pid = record.pid, dest = %dest.display(), "stopping abandoned agent");
                daemon::terminate(record.pid, AGENT_STOP_GRACE).await?
            }
            _ => false,
        };
        LocalImageStore::discard(&path)?;
        Ok(stopped)
    }

    /// Revert everything a job may have left behind on this host: an agent
    /// process still writing to `dest`, the firewall allowance, the staged
    /// download and any partial promotion.
    ///
    /// All steps are attempted; the first error is returned.
    pub async fn cleanup(&self, manifest: &Manifest, dest: &Path) -> Result<()> {
        let mut first_error = None;

        // The abandoned agent must be gone before its files are removed
        if let Err(e) = self.stop_abandoned(dest).await {
            first_error.get_or_insert(e);
        }

        if let Err(e) = self.firewall.revoke(self.settings.peer_ports).await {
            first_error.get_or_insert(e);
        }
        for path in [
            self.store.staging_path(manifest),
            LocalImageStore::partial_path(dest),
        ] {
            if let Err(e) = LocalImageStore::discard(&path) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn discard_logged(path: &Path) {
    if let Err(e) = LocalImageStore::discard(path) {
        warn!(path = %path.display(), "failed to remove transient file: {}", e);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::manifest::{ArtifactId, Checksum};
    use async_trait::async_trait;
    use chrono::Utc;
    use sha2::{Digest, Sha256};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    /// Transfer engine writing fixed bytes, optionally after a delay
    pub struct FakeTransfer {
        pub data: Vec<u8>,
        pub delay: Option<Duration>,
        pub fail: bool,
        pub calls: AtomicUsize,
    }

    impl FakeTransfer {
        pub fn new(data: &[u8]) -> Self {
            Self {
                data: data.to_vec(),
                delay: None,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TransferEngine for FakeTransfer {
        async fn fetch(&self, _manifest: &Manifest, dest: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // A partial file exists while the transfer is in flight
            std::fs::write(dest, &self.data[..self.data.len() / 2])?;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(FlotillaError::Transfer("no peers".to_string()));
            }
            std::fs::write(dest, &self.data)?;
            Ok(())
        }
    }

    /// Firewall recording the currently open ranges
    #[derive(Default)]
    pub struct FakeFirewall {
        pub open: Mutex<Vec<PortRange>>,
    }

    impl FakeFirewall {
        pub fn is_open(&self) -> bool {
            !self.open.lock().unwrap().is_empty()
        }
    }

    #[async_trait]
    impl Firewall for FakeFirewall {
        async fn allow(&self, ports: PortRange) -> Result<()> {
            let mut open = self.open.lock().unwrap();
            if !open.contains(&ports) {
                open.push(ports);
            }
            Ok(())
        }

        async fn revoke(&self, ports: PortRange) -> Result<()> {
            self.open.lock().unwrap().retain(|p| *p != ports);
            Ok(())
        }
    }

    /// Converter copying bytes with a format prefix, or failing
    pub struct FakeConverter {
        pub fail: bool,
    }

    #[async_trait]
    impl ImageConverter for FakeConverter {
        async fn convert(&self, src: &Path, dst: &Path, _from: &str, to: &str) -> Result<()> {
            if self.fail {
                return Err(FlotillaError::Conversion("corrupt image header".to_string()));
            }
            let mut data = to.as_bytes().to_vec();
            data.extend(std::fs::read(src)?);
            std::fs::write(dst, data)?;
            Ok(())
        }
    }

    pub fn sha256(data: &[u8]) -> Checksum {
        Checksum::parse(&format!("{:x}", Sha256::digest(data))).unwrap()
    }

    pub fn manifest(checksum: Checksum, source_format: Option<&str>) -> Manifest {
        Manifest {
            artifact_id: ArtifactId::new("img-1").unwrap(),
            checksum,
            source_path: PathBuf::from("/srv/images/img-1.qcow2"),
            announce: "http://seed:6969/announce".to_string(),
            size: 0,
            source_format: source_format.map(String::from),
            descriptor: Some("file:///pub/img-1.torrent".to_string()),
            created_at: Utc::now(),
        }
    }

    pub struct Harness {
        pub dir: TempDir,
        pub transfer: Arc<FakeTransfer>,
        pub firewall: Arc<FakeFirewall>,
        pub agent: Arc<NodeAgent>,
    }

    impl Harness {
        pub fn new(
            transfer: FakeTransfer,
            convert_fails: bool,
            target_format: Option<&str>,
        ) -> Self {
            let dir = tempdir().unwrap();
            let transfer = Arc::new(transfer);
            let firewall = Arc::new(FakeFirewall::default());
            let store =
                LocalImageStore::new(dir.path().join("staging"), Permissions::default()).unwrap();
            let agent = NodeAgent::new(
                transfer.clone(),
                firewall.clone(),
                Arc::new(FakeConverter {
                    fail: convert_fails,
                }),
                store,
                AgentSettings {
                    peer_ports: PortRange::new(6881, 6999).unwrap(),
                    target_format: target_format.map(String::from),
                    verify_existing: false,
                },
            );
            Self {
                dir,
                transfer,
                firewall,
                agent: Arc::new(agent),
            }
        }

        pub fn job(&self, manifest: Manifest) -> NodeTransferJob {
            NodeTransferJob::new(
                "host1",
                manifest,
                "file:///pub/img-1.manifest.json",
                self.dir.path().join("images").join("img-1.raw"),
            )
        }

        pub fn staged(&self) -> PathBuf {
            self.dir.path().join("staging").join("img-1.qcow2")
        }
    }

    #[tokio::test]
    async fn test_successful_job_with_conversion() {
        let h = Harness::new(FakeTransfer::new(b"qcow2 image"), false, Some("raw"));
        let mut job = h.job(manifest(sha256(b"qcow2 image"), Some("qcow2")));

        h.agent.run(&mut job).await;

        assert!(job.is_done(), "status: {}", job.status);
        assert!(!job.skipped);
        assert_eq!(
            std::fs::read(&job.local_dest_path).unwrap(),
            b"rawqcow2 image"
        );
        assert!(!h.staged().exists());
        assert!(!LocalImageStore::partial_path(&job.local_dest_path).exists());
        assert!(!h.firewall.is_open());
    }

    #[tokio::test]
    async fn test_job_without_conversion_installs_download() {
        let h = Harness::new(FakeTransfer::new(b"raw image"), false, None);
        let mut job = h.job(manifest(sha256(b"raw image"), Some("raw")));

        h.agent.run(&mut job).await;

        assert!(job.is_done());
        assert_eq!(std::fs::read(&job.local_dest_path).unwrap(), b"raw image");
        assert!(!h.staged().exists());
    }

    #[tokio::test]
    async fn test_existing_image_skips_transfer() {
        let h = Harness::new(FakeTransfer::new(b"image"), false, None);
        let mut job = h.job(manifest(sha256(b"image"), None));
        std::fs::create_dir_all(job.local_dest_path.parent().unwrap()).unwrap();
        std::fs::write(&job.local_dest_path, b"already here").unwrap();

        h.agent.run(&mut job).await;

        assert!(job.is_done());
        assert!(job.skipped);
        assert_eq!(job.history.len(), 2);
        assert_eq!(h.transfer.calls.load(Ordering::SeqCst), 0);
        assert!(!h.firewall.is_open());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_removes_download() {
        let h = Harness::new(FakeTransfer::new(b"tampered"), false, None);
        let mut job = h.job(manifest(Checksum::parse("abc123").unwrap(), None));

        h.agent.run(&mut job).await;

        match &job.status {
            crate::node::JobStatus::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::Integrity)
            }
            other => panic!("unexpected status {}", other),
        }
        assert!(!h.staged().exists());
        assert!(!job.local_dest_path.exists());
        assert!(!h.firewall.is_open());
    }

    #[tokio::test]
    async fn test_transfer_failure() {
        let mut transfer = FakeTransfer::new(b"image");
        transfer.fail = true;
        let h = Harness::new(transfer, false, None);
        let mut job = h.job(manifest(sha256(b"image"), None));

        h.agent.run(&mut job).await;

        assert!(matches!(
            &job.status,
            crate::node::JobStatus::Failed(f) if f.kind == FailureKind::Transfer
        ));
        assert!(!h.staged().exists());
        assert!(!h.firewall.is_open());
    }

    #[tokio::test]
    async fn test_conversion_failure_removes_transients() {
        let h = Harness::new(FakeTransfer::new(b"image"), true, Some("raw"));
        let mut job = h.job(manifest(sha256(b"image"), Some("qcow2")));

        h.agent.run(&mut job).await;

        assert!(matches!(
            &job.status,
            crate::node::JobStatus::Failed(f) if f.kind == FailureKind::Conversion
        ));
        assert!(!h.staged().exists());
        assert!(!job.local_dest_path.exists());
        assert!(!LocalImageStore::partial_path(&job.local_dest_path).exists());
    }

    #[tokio::test]
    async fn test_unknown_source_format_fails_conversion() {
        let h = Harness::new(FakeTransfer::new(b"image"), false, Some("raw"));
        let mut job = h.job(manifest(sha256(b"image"), None));

        h.agent.run(&mut job).await;

        assert!(matches!(
            &job.status,
            crate::node::JobStatus::Failed(f) if f.kind == FailureKind::Conversion
        ));
        assert!(!job.local_dest_path.exists());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_and_released_on_drop() {
        let h = Harness::new(FakeTransfer::new(b"image"), false, None);
        let dest = h.job(manifest(sha256(b"image"), None)).local_dest_path;

        let claim = h.agent.claim(&dest).unwrap();
        let recorded = read_claim(claim.path()).unwrap().unwrap();
        assert!(recorded.is_self());

        // Cleanup in the claiming process leaves its own claim alone
        assert!(!h.agent.stop_abandoned(&dest).await.unwrap());
        assert!(claim.path().exists());

        let path = claim.path().to_path_buf();
        drop(claim);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_claim_refused_while_other_agent_runs() {
        let h = Harness::new(FakeTransfer::new(b"image"), false, None);
        let dest = h.job(manifest(sha256(b"image"), None)).local_dest_path;
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();

        let mut other = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let record = ProcessRecord::of(other.id() as i32);
        std::fs::write(LocalImageStore::claim_path(&dest), format!("{}\n", record)).unwrap();

        assert!(matches!(h.agent.claim(&dest), Err(FlotillaError::Lock(_))));

        other.kill().unwrap();
        other.wait().unwrap();
        // The exited agent's claim is taken over
        h.agent.claim(&dest).unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_stops_abandoned_agent() {
        let h = Harness::new(FakeTransfer::new(b"image"), false, None);
        let job = h.job(manifest(sha256(b"image"), None));
        std::fs::create_dir_all(job.local_dest_path.parent().unwrap()).unwrap();
        std::fs::write(h.staged(), b"half").unwrap();

        // An agent whose remote shell was cut off keeps running
        let orphan = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = orphan.id() as i32;
        let claim = LocalImageStore::claim_path(&job.local_dest_path);
        std::fs::write(&claim, format!("{}\n", ProcessRecord::of(pid))).unwrap();

        h.agent
            .cleanup(&job.manifest, &job.local_dest_path)
            .await
            .unwrap();
        assert!(!daemon::is_alive(pid));
        assert!(!claim.exists());
        assert!(!h.staged().exists());
    }

    #[tokio::test]
    async fn test_cleanup_after_cancelled_fetch() {
        let mut transfer = FakeTransfer::new(b"slow image");
        transfer.delay = Some(Duration::from_secs(30));
        let h = Harness::new(transfer, false, None);
        let mut job = h.job(manifest(sha256(b"slow image"), None));

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), h.agent.run(&mut job)).await;
        assert!(cancelled.is_err());
        assert!(h.staged().exists());
        assert!(h.firewall.is_open());

        h.agent
            .cleanup(&job.manifest, &job.local_dest_path)
            .await
            .unwrap();
        assert!(!h.staged().exists());
        assert!(!h.firewall.is_open());
    }
}
