//! Seed-side swarm management
//!
//! This module owns the lifecycle of a published artifact on the seed
//! host: manifest publication, tracker and seeder daemons, and teardown.

pub mod coordinator;
pub mod daemon;
pub mod session;

pub use coordinator::{PublishRequest, SwarmControl, SwarmCoordinator};
pub use daemon::{DaemonHandle, DaemonProcess, ProcessRecord};
pub use session::{SessionLease, SessionState, SwarmSession};
