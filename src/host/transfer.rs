//! Swarm transfer engine

use crate::error::{FlotillaError, Result};
use crate::exec::{self, CommandTemplate};
use crate::manifest::{self, Manifest};
use async_trait::async_trait;
use std::path::Path;

/// Content-addressed swarm download.
///
/// Implementations must leave the artifact at `dest` on success. Dropping
/// the returned future must stop the transfer.
#[async_trait]
pub trait TransferEngine: Send + Sync {
    async fn fetch(&self, manifest: &Manifest, dest: &Path) -> Result<()>;
}

/// Transfer engine backed by an external peer-to-peer client
pub struct CommandTransferEngine {
    template: CommandTemplate,
}

impl CommandTransferEngine {
    pub fn new(template: CommandTemplate) -> Self {
        Self { template }
    }
}

#[async_trait]
impl TransferEngine for CommandTransferEngine {
    async fn fetch(&self, manifest: &Manifest, dest: &Path) -> Result<()> {
        let descriptor = manifest.descriptor.as_deref().ok_or_else(|| {
            FlotillaError::Transfer(format!(
                "manifest for {} has no swarm descriptor",
                manifest.artifact_id
            ))
        })?;
        // Peer-to-peer clients take a descriptor path, not a file:// URI
        let descriptor = manifest::local_path(descriptor);
        let dest_dir = dest.parent().ok_or_else(|| {
            FlotillaError::Transfer(format!("invalid destination {}", dest.display()))
        })?;

        let dest_str = dest.to_string_lossy();
        let dest_dir_str = dest_dir.to_string_lossy();
        let argv = self.template.render(&[
            ("descriptor", descriptor),
            ("dest", &dest_str),
            ("dest_dir", &dest_dir_str),
            ("announce", &manifest.announce),
        ])?;

        let output = exec::run(&argv)
            .await
            .map_err(|e| FlotillaError::Transfer(e.to_string()))?;
        if !output.success() {
            return Err(FlotillaError::Transfer(format!(
                "{} failed with {}",
                argv[0],
                output.describe()
            )));
        }

        if !dest.exists() {
            return Err(FlotillaError::Transfer(format!(
                "{} exited cleanly but {} is missing",
                argv[0],
                dest.display()
            )));
        }

        Ok(())
    }
}
