//! Artifact integrity verification

use crate::error::Result;
use crate::manifest::Checksum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const CHUNK_SIZE: usize = 1024 * 1024;

/// Outcome of a verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "result")]
pub enum Verification {
    /// Digest matches the expected checksum
    Valid,
    /// Digest differs from the expected checksum
    Mismatch { actual: Checksum },
}

/// SHA-256 verifier for artifacts on local disk.
///
/// Verification only reads the file; calling it twice on an unmodified file
/// yields the same outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Compute the SHA-256 of a file, streamed in fixed-size chunks
    pub fn checksum(&self, path: &Path) -> Result<Checksum> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Checksum::parse(&format!("{:x}", hasher.finalize()))
    }

    /// Compare a file against an expected checksum.
    ///
    /// A missing or unreadable file is an error, not a mismatch.
    pub fn verify(&self, path: &Path, expected: &Checksum) -> Result<Verification> {
        let actual = self.checksum(path)?;
        if &actual == expected {
            Ok(Verification::Valid)
        } else {
            Ok(Verification::Mismatch { actual })
        }
    }
}
