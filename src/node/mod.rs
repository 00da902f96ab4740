//! Node-side transfer jobs and the agent that drives them

pub mod agent;
pub mod job;

pub use agent::{AgentClaim, AgentSettings, NodeAgent};
pub use job::{Failure, FailureKind, JobStatus, NodeTransferJob, Transition};
