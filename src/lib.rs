//! Flotilla - fleet-wide distribution of disk images over a peer-to-peer swarm
//!
//! A seed host publishes a content-addressed manifest and starts a tracker
//! and seeder; a node agent on every target host fetches the image through
//! the swarm, verifies it and promotes it into the local image store. The
//! fleet orchestrator ties both sides together:
//!
//! - Manifest publication and swarm lifecycle (`swarm`)
//! - Per-host transfer jobs and the node agent (`node`)
//! - Concurrent dispatch with per-node and global deadlines (`fleet`)
//! - Integrity verification (`integrity`)
//! - External tool wrappers (`host`, `exec`)

pub mod config;
pub mod error;
pub mod exec;
pub mod fleet;
pub mod host;
pub mod integrity;
pub mod manifest;
pub mod node;
pub mod swarm;

pub use error::{FlotillaError, Result};
