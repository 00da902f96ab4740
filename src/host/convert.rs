//! Image format conversion

use crate::error::{FlotillaError, Result};
use crate::exec::{self, CommandTemplate};
use async_trait::async_trait;
use std::path::Path;

/// Converts an image between container formats
#[async_trait]
pub trait ImageConverter: Send + Sync {
    async fn convert(&self, src: &Path, dst: &Path, from: &str, to: &str) -> Result<()>;
}

/// Converter backed by an external tool (`qemu-img` by default)
pub struct CommandConverter {
    template: CommandTemplate,
}

impl CommandConverter {
    pub fn new(template: CommandTemplate) -> Self {
        Self { template }
    }
}

#[async_trait]
impl ImageConverter for CommandConverter {
    async fn convert(&self, src: &Path, dst: &Path, from: &str, to: &str) -> Result<()> {
        let src_str = src.to_string_lossy();
        let dst_str = dst.to_string_lossy();
        let argv = self.template.render(&[
            ("src", &src_str),
            ("dst", &dst_str),
            ("from", from),
            ("to", to),
        ])?;

        let output = exec::run(&argv)
            .await
            .map_err(|e| FlotillaError::Conversion(e.to_string()))?;
        if !output.success() {
            return Err(FlotillaError::Conversion(format!(
                "{} -> {} failed with {}",
                from,
                to,
                output.describe()
            )));
        }

        Ok(())
    }
}
