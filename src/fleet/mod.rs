//! Fleet-wide distribution runs
//!
//! The orchestrator publishes an artifact through the swarm coordinator,
//! dispatches one node agent per target host and aggregates the outcome.

pub mod dispatch;
pub mod orchestrator;
pub mod report;

pub use dispatch::{AgentDispatcher, LocalDispatcher, RoutingDispatcher, SshDispatcher};
pub use orchestrator::{Destination, FleetOrchestrator, RunRequest};
pub use report::FleetRunResult;
