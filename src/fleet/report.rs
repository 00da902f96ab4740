//! Fleet run results

use crate::manifest::ArtifactId;
use crate::node::{JobStatus, NodeTransferJob};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Outcome of one fleet run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetRunResult {
    /// Run ID
    pub run_id: String,
    /// Distributed artifact
    pub artifact_id: ArtifactId,
    /// Final job per target host
    pub jobs: BTreeMap<String, NodeTransferJob>,
    /// Whether swarm teardown ran
    pub torn_down: bool,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
}

impl FleetRunResult {
    /// Status of one host
    pub fn status(&self, host: &str) -> Option<&JobStatus> {
        self.jobs.get(host).map(|job| &job.status)
    }

    /// Check if every host reached Done
    pub fn all_done(&self) -> bool {
        self.jobs.values().all(NodeTransferJob::is_done)
    }

    /// Hosts whose job failed
    pub fn failed_hosts(&self) -> Vec<&str> {
        self.jobs
            .iter()
            .filter(|(_, job)| matches!(job.status, JobStatus::Failed(_)))
            .map(|(host, _)| host.as_str())
            .collect()
    }

    /// Process exit code: 0 when every host is Done, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.all_done() {
            0
        } else {
            1
        }
    }

    /// Per-host outcome table
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<24} {:<26} {:<8} {}",
            "HOST", "STATUS", "SKIPPED", "DETAIL"
        );
        for (host, job) in &self.jobs {
            let detail = match &job.status {
                JobStatus::Failed(failure) => failure.message.clone(),
                _ => job.local_dest_path.display().to_string(),
            };
            let _ = writeln!(
                out,
                "{:<24} {:<26} {:<8} {}",
                host,
                job.status.to_string(),
                if job.skipped { "yes" } else { "no" },
                detail
            );
        }
        let _ = writeln!(
            out,
            "{}: {}/{} hosts done in {}s",
            self.artifact_id,
            self.jobs.values().filter(|job| job.is_done()).count(),
            self.jobs.len(),
            (self.finished_at - self.started_at).num_seconds()
        );
        out
    }
}
