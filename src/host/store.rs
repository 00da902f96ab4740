//! Local image store - final home of promoted artifacts on a node

use crate::error::{FlotillaError, Result};
use crate::manifest::{Checksum, Manifest};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Ownership and mode applied to promoted images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    /// File mode
    pub mode: u32,
    /// Owner uid
    pub owner: Option<u32>,
    /// Owner gid
    pub group: Option<u32>,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            mode: 0o644,
            owner: None,
            group: None,
        }
    }
}

/// Local image store for a node
#[derive(Debug, Clone)]
pub struct LocalImageStore {
    /// Transient download directory
    staging_dir: PathBuf,
    /// Permissions for promoted images
    permissions: Permissions,
}

impl LocalImageStore {
    /// Create a new image store
    pub fn new(staging_dir: PathBuf, permissions: Permissions) -> Result<Self> {
        std::fs::create_dir_all(&staging_dir)?;

        Ok(Self {
            staging_dir,
            permissions,
        })
    }

    /// Get staging path
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Where the transfer engine drops the raw artifact
    pub fn staging_path(&self, manifest: &Manifest) -> PathBuf {
        self.staging_dir.join(manifest.file_name())
    }

    /// Checksum stamp written next to a promoted image
    pub fn stamp_path(dest: &Path) -> PathBuf {
        let mut name = dest.as_os_str().to_os_string();
        name.push(".sha256");
        PathBuf::from(name)
    }

    /// Pid file of the agent process writing to `dest`
    pub fn claim_path(dest: &Path) -> PathBuf {
        let mut name = dest.as_os_str().to_os_string();
        name.push(".agent.pid");
        PathBuf::from(name)
    }

    /// Temporary sibling a promotion is written to before the final rename
    pub fn partial_path(dest: &Path) -> PathBuf {
        let mut name = dest.as_os_str().to_os_string();
        name.push(".partial");
        PathBuf::from(name)
    }

    /// Check whether an image is already present at `dest`.
    ///
    /// With `check_stamp`, the promotion stamp must also record `checksum`.
    pub fn is_present(&self, dest: &Path, checksum: &Checksum, check_stamp: bool) -> bool {
        if !dest.is_file() {
            return false;
        }
        if !check_stamp {
            return true;
        }

        match std::fs::read_to_string(Self::stamp_path(dest)) {
            Ok(stamp) => Checksum::parse(&stamp).map(|s| &s == checksum).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Move a fully written image into place with the store's permissions
    /// and record the checksum it was promoted from.
    pub fn install(&self, prepared: &Path, dest: &Path, checksum: &Checksum) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::set_permissions(
            prepared,
            std::fs::Permissions::from_mode(self.permissions.mode),
        )?;
        if self.permissions.owner.is_some() || self.permissions.group.is_some() {
            std::os::unix::fs::chown(prepared, self.permissions.owner, self.permissions.group)
                .map_err(|e| {
                    FlotillaError::Conversion(format!(
                        "cannot set ownership of {}: {}",
                        prepared.display(),
                        e
                    ))
                })?;
        }

        if let Err(e) = std::fs::rename(prepared, dest) {
            // Staging and destination may live on different filesystems
            if e.raw_os_error() == Some(libc::EXDEV) {
                let tmp = Self::partial_path(dest);
                std::fs::copy(prepared, &tmp)?;
                std::fs::rename(&tmp, dest)?;
                std::fs::remove_file(prepared)?;
            } else {
                return Err(e.into());
            }
        }

        std::fs::write(Self::stamp_path(dest), format!("{}\n", checksum))?;
        Ok(())
    }

    /// Remove a transient file. Returns false when it was already gone.
    pub fn discard(path: &Path) -> Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_install_sets_mode_and_stamp() {
        let temp = tempdir().unwrap();
        let store = LocalImageStore::new(
            temp.path().join("staging"),
            Permissions {
                mode: 0o640,
                ..Default::default()
            },
        )
        .unwrap();

        let prepared = store.staging_dir().join("img-1.raw");
        std::fs::write(&prepared, b"image").unwrap();
        let dest = temp.path().join("images").join("img-1.raw");
        let checksum = Checksum::parse("abc123").unwrap();

        store.install(&prepared, &dest, &checksum).unwrap();

        assert!(!prepared.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"image");
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o640);
        assert!(store.is_present(&dest, &checksum, true));
        assert!(!store.is_present(&dest, &Checksum::parse("ffff").unwrap(), true));
    }

    #[test]
    fn test_is_present_without_stamp() {
        let temp = tempdir().unwrap();
        let store = LocalImageStore::new(temp.path().join("staging"), Permissions::default())
            .unwrap();
        let dest = temp.path().join("img-1.raw");
        let checksum = Checksum::parse("abc123").unwrap();

        assert!(!store.is_present(&dest, &checksum, false));
        std::fs::write(&dest, b"old image").unwrap();
        assert!(store.is_present(&dest, &checksum, false));
        assert!(!store.is_present(&dest, &checksum, true));
    }

    #[test]
    fn test_discard_is_idempotent() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("partial");
        std::fs::write(&path, b"x").unwrap();
        assert!(LocalImageStore::discard(&path).unwrap());
        assert!(!LocalImageStore::discard(&path).unwrap());
    }
}
