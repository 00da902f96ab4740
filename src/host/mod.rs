//! Node-local capabilities
//!
//! This module wraps the external tools a node agent drives on its own
//! host (transfer client, firewall, image converter) behind traits, and
//! provides the local image store artifacts are promoted into.

pub mod convert;
pub mod firewall;
pub mod store;
pub mod transfer;

pub use convert::{CommandConverter, ImageConverter};
pub use firewall::{CommandFirewall, Firewall};
pub use store::{LocalImageStore, Permissions};
pub use transfer::{CommandTransferEngine, TransferEngine};
