//! Published artifact manifests
//!
//! A [`Manifest`] is the immutable description of one artifact. The seed
//! host writes it into the publish directory and hands every node agent a
//! URI to it, so no node needs to share the seed host's filesystem layout.

use crate::error::{FlotillaError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Opaque content identifier of an artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Validate and wrap an artifact id.
    ///
    /// Ids name files on every host, so path separators and whitespace are
    /// rejected.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty()
            || id.starts_with('.')
            || id
                .chars()
                .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control())
        {
            return Err(FlotillaError::Config(format!("invalid artifact id: {:?}", id)));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ArtifactId {
    type Error = FlotillaError;

    fn try_from(value: String) -> Result<Self> {
        ArtifactId::new(value)
    }
}

impl From<ArtifactId> for String {
    fn from(id: ArtifactId) -> Self {
        id.0
    }
}

/// Strong content hash, stored as lowercase hex without an algorithm prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum(String);

impl Checksum {
    /// Parse a checksum, accepting an optional `sha256:` prefix
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        let hex = trimmed.strip_prefix("sha256:").unwrap_or(trimmed);
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(FlotillaError::Config(format!("invalid checksum: {:?}", value)));
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Checksum {
    type Error = FlotillaError;

    fn try_from(value: String) -> Result<Self> {
        Checksum::parse(&value)
    }
}

impl From<Checksum> for String {
    fn from(checksum: Checksum) -> Self {
        checksum.0
    }
}

/// Published description of an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Content identifier
    pub artifact_id: ArtifactId,
    /// Expected SHA-256 of the artifact bytes
    pub checksum: Checksum,
    /// Location of the artifact on the seed host
    pub source_path: PathBuf,
    /// Tracker announce endpoint
    pub announce: String,
    /// Size of the artifact in bytes
    pub size: u64,
    /// Container format of the artifact (e.g. `qcow2`)
    #[serde(default)]
    pub source_format: Option<String>,
    /// URI of the swarm descriptor consumed by the transfer engine
    #[serde(default)]
    pub descriptor: Option<String>,
    /// Publication timestamp
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    /// File name the artifact is staged under on the nodes
    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.artifact_id.to_string())
    }
}

/// Writes and removes manifest descriptors in the publish directory
#[derive(Debug, Clone)]
pub struct ManifestStore {
    /// Directory manifests are written to
    publish_dir: PathBuf,
    /// Base URL under which the publish directory is served
    base_url: Option<String>,
}

impl ManifestStore {
    /// Create a manifest store rooted at the publish directory
    pub fn new(publish_dir: PathBuf, base_url: Option<String>) -> Result<Self> {
        std::fs::create_dir_all(&publish_dir)?;

        Ok(Self {
            publish_dir,
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
        })
    }

    /// Publish directory
    pub fn publish_dir(&self) -> &Path {
        &self.publish_dir
    }

    /// Path of the manifest descriptor for an artifact
    pub fn path_for(&self, id: &ArtifactId) -> PathBuf {
        self.publish_dir.join(format!("{}.manifest.json", id))
    }

    /// URI under which nodes can reach a file in the publish directory
    pub fn uri_for_file(&self, file_name: &str) -> String {
        match &self.base_url {
            Some(base) => format!("{}/{}", base, file_name),
            None => format!("file://{}", self.publish_dir.join(file_name).display()),
        }
    }

    /// URI of the manifest descriptor for an artifact
    pub fn uri_for(&self, id: &ArtifactId) -> String {
        self.uri_for_file(&format!("{}.manifest.json", id))
    }

    /// Write a manifest descriptor and return its URI
    pub fn write(&self, manifest: &Manifest) -> Result<String> {
        let path = self.path_for(&manifest.artifact_id);
        let tmp = path.with_extension("json.tmp");

        std::fs::write(&tmp, serde_json::to_vec_pretty(manifest)?)?;
        std::fs::rename(&tmp, &path)?;

        Ok(self.uri_for(&manifest.artifact_id))
    }

    /// Remove a manifest descriptor. Returns false when it was already gone.
    pub fn remove(&self, id: &ArtifactId) -> Result<bool> {
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Check whether a descriptor is currently published
    pub fn exists(&self, id: &ArtifactId) -> bool {
        self.path_for(id).exists()
    }
}

/// Local path named by a `file://` URI, or the URI itself when it has no
/// scheme
pub fn local_path(uri: &str) -> &str {
    uri.strip_prefix("file://").unwrap_or(uri)
}

/// Load a manifest from a `file://`, `http(s)://` or plain path URI
pub async fn load(uri: &str) -> Result<Manifest> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        let response = reqwest::get(uri).await?;
        if !response.status().is_success() {
            return Err(FlotillaError::Transfer(format!(
                "manifest fetch from {} returned {}",
                uri,
                response.status()
            )));
        }
        let manifest = response.json::<Manifest>().await?;
        return Ok(manifest);
    }

    let path = local_path(uri);
    let content = tokio::fs::read(path).await.map_err(|e| {
        FlotillaError::Transfer(format!("cannot read manifest {}: {}", uri, e))
    })?;
    Ok(serde_json::from_slice(&content)?)
}
