//! Swarm sessions
//!
//! A live session is also recorded as a lease file in the state directory,
//! so separate `flotilla run` processes on the same seed host see each
//! other's sessions.

use super::daemon::{DaemonHandle, ProcessRecord};
use crate::error::{FlotillaError, Result};
use crate::manifest::{ArtifactId, Manifest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Swarm session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Manifest is being written
    Publishing,
    /// Tracker and seeder are running
    Seeding,
    /// Daemons are being stopped
    TearingDown,
    /// Nothing left running; the artifact may be published again
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Publishing => write!(f, "publishing"),
            SessionState::Seeding => write!(f, "seeding"),
            SessionState::TearingDown => write!(f, "tearing down"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Seed-side lifecycle of one published artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmSession {
    /// Session ID
    pub id: String,
    /// Published manifest
    pub manifest: Manifest,
    /// URI the manifest is reachable under
    pub manifest_uri: String,
    /// Tracker `host:port`
    pub tracker_address: String,
    /// Tracker process
    pub tracker: Option<DaemonHandle>,
    /// Seeder process
    pub seeder: Option<DaemonHandle>,
    /// Current state
    pub state: SessionState,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl SwarmSession {
    /// Create a session in the publishing state
    pub fn new(manifest: Manifest, manifest_uri: String, tracker_address: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            manifest,
            manifest_uri,
            tracker_address,
            tracker: None,
            seeder: None,
            state: SessionState::Publishing,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check whether the session still blocks its artifact id
    pub fn is_live(&self) -> bool {
        self.state != SessionState::Closed
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// Claim on an artifact id held by the process running its session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLease {
    /// Session holding the artifact id
    pub session_id: String,
    /// Process running the session
    pub owner: ProcessRecord,
    /// When the lease was taken
    pub created_at: DateTime<Utc>,
}

impl SessionLease {
    /// Lease file for an artifact
    pub fn path(state_dir: &Path, artifact: &ArtifactId) -> PathBuf {
        state_dir.join(format!("{}.session", artifact))
    }

    /// Read the lease recorded for an artifact. A malformed lease reads as
    /// absent.
    pub fn read(state_dir: &Path, artifact: &ArtifactId) -> Result<Option<Self>> {
        let path = Self::path(state_dir, artifact);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&content) {
            Ok(lease) => Ok(Some(lease)),
            Err(e) => {
                warn!(path = %path.display(), "ignoring malformed session lease: {}", e);
                Ok(None)
            }
        }
    }

    /// Whether the owning process is still running
    pub fn is_held(&self) -> bool {
        self.owner.is_running()
    }

    /// Take the lease on an artifact for a session of this process.
    ///
    /// Fails with a conflict while another running session holds it. A lease
    /// left by a process that has exited is replaced.
    pub fn acquire(state_dir: &Path, artifact: &ArtifactId, session_id: &str) -> Result<Self> {
        let lease = Self {
            session_id: session_id.to_string(),
            owner: ProcessRecord::current(),
            created_at: Utc::now(),
        };
        let path = Self::path(state_dir, artifact);

        // Linking a complete file into place never exposes a half-written lease
        let tmp = state_dir.join(format!("{}.session.{}.tmp", artifact, session_id));
        std::fs::write(&tmp, serde_json::to_vec(&lease)?)?;
        let linked = Self::link(&tmp, &path, state_dir, artifact);
        if let Err(e) = std::fs::remove_file(&tmp) {
            debug!(path = %tmp.display(), "failed to remove lease scratch file: {}", e);
        }
        linked?;
        Ok(lease)
    }

    fn link(tmp: &Path, path: &Path, state_dir: &Path, artifact: &ArtifactId) -> Result<()> {
        for _ in 0..2 {
            match std::fs::hard_link(tmp, path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            match Self::read(state_dir, artifact)? {
                Some(existing) if existing.is_held() => {
                    return Err(FlotillaError::Conflict(format!(
                        "{} (session {} in pid {})",
                        artifact, existing.session_id, existing.owner.pid
                    )));
                }
                existing => {
                    if let Some(existing) = existing {
                        warn!(
                            artifact = %artifact,
                            session = %existing.session_id,
                            pid = existing.owner.pid,
                            "replacing lease of exited session"
                        );
                    }
                    match std::fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        Err(FlotillaError::Conflict(format!("{} (lease contended)", artifact)))
    }

    /// Remove the lease if it still belongs to `session_id`. Returns whether
    /// a lease was removed.
    pub fn release(state_dir: &Path, artifact: &ArtifactId, session_id: &str) -> Result<bool> {
        match Self::read(state_dir, artifact)? {
            Some(lease) if lease.session_id == session_id => {
                Self::remove(state_dir, artifact)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remove whatever lease is recorded for an artifact
    pub fn remove(state_dir: &Path, artifact: &ArtifactId) -> Result<bool> {
        match std::fs::remove_file(Self::path(state_dir, artifact)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
