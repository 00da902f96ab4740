//! Node transfer jobs

use crate::error::{FlotillaError, Result};
use crate::manifest::Manifest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Why a job failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Fetch failed or stalled
    Transfer,
    /// Checksum mismatch
    Integrity,
    /// Format conversion or installation failed
    Conversion,
    /// Per-node or global deadline exceeded
    Timeout,
    /// Agent could not be configured or launched
    Config,
    /// Remote shell or agent report failure
    Remote,
    /// Anything else
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Transfer => "TransferError",
            FailureKind::Integrity => "IntegrityError",
            FailureKind::Conversion => "ConversionError",
            FailureKind::Timeout => "TimeoutError",
            FailureKind::Config => "ConfigError",
            FailureKind::Remote => "RemoteError",
            FailureKind::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

/// Failure reason carried by a failed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a crate error into a job failure of the given default kind
    pub fn from_error(default: FailureKind, err: &FlotillaError) -> Self {
        let kind = match err {
            FlotillaError::Transfer(_) | FlotillaError::Firewall(_) => FailureKind::Transfer,
            FlotillaError::Integrity(_) => FailureKind::Integrity,
            FlotillaError::Conversion(_) => FailureKind::Conversion,
            FlotillaError::Timeout(_) => FailureKind::Timeout,
            FlotillaError::Config(_) | FlotillaError::Yaml(_) => FailureKind::Config,
            FlotillaError::Remote(_) => FailureKind::Remote,
            _ => default,
        };
        Self::new(kind, err.to_string())
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Job status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is created, nothing done yet
    #[default]
    Pending,
    /// Artifact is being downloaded
    Fetching,
    /// Downloaded artifact is being checked
    Verifying,
    /// Verified artifact is being converted and installed
    Promoting,
    /// Artifact is installed at its destination
    Done,
    /// Job failed
    Failed(Failure),
}

impl JobStatus {
    /// Check if the status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed(_))
    }

    fn name(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Fetching => "fetching",
            JobStatus::Verifying => "verifying",
            JobStatus::Promoting => "promoting",
            JobStatus::Done => "done",
            JobStatus::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => f.write_str("Pending"),
            JobStatus::Fetching => f.write_str("Fetching"),
            JobStatus::Verifying => f.write_str("Verifying"),
            JobStatus::Promoting => f.write_str("Promoting"),
            JobStatus::Done => f.write_str("Done"),
            JobStatus::Failed(failure) => write!(f, "Failed({})", failure.kind),
        }
    }
}

/// Recorded status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
}

/// One artifact delivery to one host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTransferJob {
    /// Job ID
    pub id: String,
    /// Host the artifact is delivered to
    pub target_host: String,
    /// Artifact manifest
    pub manifest: Manifest,
    /// URI the manifest was published under
    pub manifest_uri: String,
    /// Final location of the image on the host
    pub local_dest_path: PathBuf,
    /// Current status
    pub status: JobStatus,
    /// The fetch was short-circuited by an image already in place
    pub skipped: bool,
    /// Status history
    pub history: Vec<Transition>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl NodeTransferJob {
    /// Create a new pending job
    pub fn new(
        target_host: &str,
        manifest: Manifest,
        manifest_uri: &str,
        local_dest_path: PathBuf,
    ) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            target_host: target_host.to_string(),
            manifest,
            manifest_uri: manifest_uri.to_string(),
            local_dest_path,
            status: JobStatus::Pending,
            skipped: false,
            history: vec![Transition {
                status: JobStatus::Pending,
                at: now,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: JobStatus) -> Result<()> {
        let allowed = match (&self.status, &next) {
            (current, JobStatus::Failed(_)) => !current.is_terminal(),
            (JobStatus::Pending, JobStatus::Fetching)
            | (JobStatus::Pending, JobStatus::Done)
            | (JobStatus::Fetching, JobStatus::Verifying)
            | (JobStatus::Verifying, JobStatus::Promoting)
            | (JobStatus::Promoting, JobStatus::Done) => true,
            _ => false,
        };

        if !allowed {
            return Err(FlotillaError::Internal(format!(
                "job {} on {}: invalid transition {} -> {}",
                self.id,
                self.target_host,
                self.status.name(),
                next.name()
            )));
        }

        tracing::debug!(
            host = %self.target_host,
            from = self.status.name(),
            to = next.name(),
            "job transition"
        );

        let now = Utc::now();
        self.history.push(Transition {
            status: next.clone(),
            at: now,
        });
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Begin downloading
    pub fn start_fetch(&mut self) -> Result<()> {
        self.transition(JobStatus::Fetching)
    }

    /// Begin verifying the download
    pub fn start_verify(&mut self) -> Result<()> {
        self.transition(JobStatus::Verifying)
    }

    /// Begin promoting the verified artifact
    pub fn start_promote(&mut self) -> Result<()> {
        self.transition(JobStatus::Promoting)
    }

    /// Complete the job
    pub fn complete(&mut self) -> Result<()> {
        self.transition(JobStatus::Done)
    }

    /// Complete a pending job whose image is already in place
    pub fn skip(&mut self) -> Result<()> {
        if self.status != JobStatus::Pending {
            return Err(FlotillaError::Internal(format!(
                "job {} can only be skipped while pending",
                self.id
            )));
        }
        self.transition(JobStatus::Done)?;
        self.skipped = true;
        Ok(())
    }

    /// Fail the job. Failing a job that is already terminal is an error.
    pub fn fail(&mut self, failure: Failure) -> Result<()> {
        self.transition(JobStatus::Failed(failure))
    }

    /// Force a terminal failure regardless of the current state.
    ///
    /// Used by the orchestrator when an agent never reported back.
    pub fn force_fail(&mut self, failure: Failure) {
        if self.status.is_terminal() {
            let now = Utc::now();
            self.status = JobStatus::Failed(failure);
            self.history.push(Transition {
                status: self.status.clone(),
                at: now,
            });
            self.updated_at = now;
        } else if let Err(e) = self.fail(failure) {
            tracing::error!("{}", e);
        }
    }

    /// Check if job is terminal
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if job is done
    pub fn is_done(&self) -> bool {
        self.status == JobStatus::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ArtifactId, Checksum};

    fn job() -> NodeTransferJob {
        let manifest = Manifest {
            artifact_id: ArtifactId::new("img-1").unwrap(),
            checksum: Checksum::parse("abc123").unwrap(),
            source_path: PathBuf::from("/srv/img-1"),
            announce: "http://seed:6969/announce".to_string(),
            size: 0,
            source_format: None,
            descriptor: None,
            created_at: Utc::now(),
        };
        NodeTransferJob::new(
            "host1",
            manifest,
            "file:///pub/img-1.manifest.json",
            PathBuf::from("/images/img-1"),
        )
    }

    #[test]
    fn test_job_lifecycle() {
        let mut job = job();
        assert_eq!(job.status, JobStatus::Pending);

        job.start_fetch().unwrap();
        job.start_verify().unwrap();
        job.start_promote().unwrap();
        job.complete().unwrap();

        assert!(job.is_done());
        assert!(job.is_terminal());
        assert_eq!(job.history.len(), 5);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut job = job();
        assert!(job.start_verify().is_err());
        assert!(job.start_promote().is_err());

        job.start_fetch().unwrap();
        assert!(job.complete().is_err());
        assert!(job.skip().is_err());
    }

    #[test]
    fn test_skip() {
        let mut job = job();
        job.skip().unwrap();
        assert!(job.is_done());
        assert!(job.skipped);
    }

    #[test]
    fn test_job_failure() {
        let mut job = job();
        job.start_fetch().unwrap();
        job.fail(Failure::new(FailureKind::Transfer, "peer vanished")).unwrap();

        assert!(job.is_terminal());
        assert_eq!(job.status.to_string(), "Failed(TransferError)");
        assert!(job
            .fail(Failure::new(FailureKind::Transfer, "again"))
            .is_err());
    }

    #[test]
    fn test_force_fail_overrides_terminal() {
        let mut job = job();
        job.skip().unwrap();
        job.force_fail(Failure::new(FailureKind::Timeout, "deadline"));
        assert!(matches!(
            job.status,
            JobStatus::Failed(Failure {
                kind: FailureKind::Timeout,
                ..
            })
        ));
    }

    #[test]
    fn test_status_json() {
        let status = JobStatus::Failed(Failure::new(FailureKind::Integrity, "mismatch"));
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"state\":\"failed\""));
        assert!(json.contains("\"kind\":\"integrity\""));
        let back: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn test_failure_classification() {
        let failure =
            Failure::from_error(FailureKind::Internal, &FlotillaError::Firewall("denied".into()));
        assert_eq!(failure.kind, FailureKind::Transfer);
        let failure =
            Failure::from_error(FailureKind::Remote, &FlotillaError::Internal("oops".into()));
        assert_eq!(failure.kind, FailureKind::Remote);
    }
}
