//! Agent dispatch - getting a transfer job onto its target host

use crate::config::RemoteSettings;
use crate::error::{FlotillaError, Result};
use crate::exec;
use crate::node::{Failure, FailureKind, NodeAgent, NodeTransferJob};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Runs node agents for the orchestrator
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Run a job on its target host and return it in a terminal state.
    ///
    /// Dropping the future must stop the remote work.
    async fn dispatch(&self, job: NodeTransferJob) -> NodeTransferJob;

    /// Revert transient state left by a job whose agent did not finish
    async fn cleanup(&self, job: &NodeTransferJob) -> Result<()>;
}

/// Runs the agent in this process
pub struct LocalDispatcher {
    agent: Arc<NodeAgent>,
}

impl LocalDispatcher {
    pub fn new(agent: Arc<NodeAgent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl AgentDispatcher for LocalDispatcher {
    async fn dispatch(&self, mut job: NodeTransferJob) -> NodeTransferJob {
        self.agent.run(&mut job).await;
        job
    }

    async fn cleanup(&self, job: &NodeTransferJob) -> Result<()> {
        self.agent
            .cleanup(&job.manifest, &job.local_dest_path)
            .await
    }
}

/// Launches `flotilla agent` on the target host over the remote shell
pub struct SshDispatcher {
    remote: RemoteSettings,
    target_format: Option<String>,
}

impl SshDispatcher {
    pub fn new(remote: RemoteSettings, target_format: Option<String>) -> Self {
        Self {
            remote,
            target_format,
        }
    }

    /// Remote shell argv for running `remote_args` on `host`
    pub fn command(&self, host: &str, remote_args: &[String]) -> Vec<String> {
        let mut argv = vec![self.remote.ssh_program.clone()];
        argv.extend(self.remote.options.iter().cloned());
        if let Some(port) = self.remote.port {
            argv.push("-p".to_string());
            argv.push(port.to_string());
        }
        if let Some(identity) = &self.remote.identity {
            argv.push("-i".to_string());
            argv.push(identity.display().to_string());
        }
        if let Some(user) = &self.remote.user {
            argv.push("-l".to_string());
            argv.push(user.clone());
        }
        argv.push(host.to_string());

        // The remote shell joins its arguments into one command line
        let remote = std::iter::once(self.remote.agent_path.as_str())
            .chain(remote_args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ");
        argv.push(remote);
        argv
    }

    fn job_args(&self, subcommand: &str, job: &NodeTransferJob) -> Vec<String> {
        let mut args = vec![
            subcommand.to_string(),
            "--manifest-uri".to_string(),
            job.manifest_uri.clone(),
            "--dest".to_string(),
            job.local_dest_path.display().to_string(),
        ];
        if subcommand == "agent" {
            if let Some(format) = &self.target_format {
                args.push("--target-format".to_string());
                args.push(format.clone());
            }
        }
        args
    }
}

#[async_trait]
impl AgentDispatcher for SshDispatcher {
    async fn dispatch(&self, mut job: NodeTransferJob) -> NodeTransferJob {
        let argv = self.command(&job.target_host, &self.job_args("agent", &job));

        let output = match exec::run(&argv).await {
            Ok(output) => output,
            Err(e) => {
                job.force_fail(Failure::from_error(FailureKind::Remote, &e));
                return job;
            }
        };

        match parse_report(&output.stdout) {
            Some(report) => {
                debug!(host = %job.target_host, status = %report.status, "agent reported");
                job.status = report.status;
                job.skipped = report.skipped;
                job.history = report.history;
                job.updated_at = report.updated_at;
                if !job.is_terminal() {
                    job.force_fail(Failure::new(
                        FailureKind::Remote,
                        "agent reported a non-terminal job",
                    ));
                }
            }
            None => {
                // Exit code 2 is the agent's configuration error
                let kind = if output.code == 2 {
                    FailureKind::Config
                } else {
                    FailureKind::Remote
                };
                warn!(host = %job.target_host, "agent produced no report: {}", output.describe());
                job.force_fail(Failure::new(
                    kind,
                    format!("agent produced no report ({})", output.describe()),
                ));
            }
        }
        job
    }

    async fn cleanup(&self, job: &NodeTransferJob) -> Result<()> {
        let argv = self.command(&job.target_host, &self.job_args("agent-cleanup", job));
        let output = exec::run(&argv).await?;
        if output.success() {
            Ok(())
        } else {
            Err(FlotillaError::Remote(format!(
                "cleanup on {} failed with {}",
                job.target_host,
                output.describe()
            )))
        }
    }
}

/// Sends configured local hosts to the in-process agent and everything
/// else over the remote shell
pub struct RoutingDispatcher {
    local_hosts: Vec<String>,
    local: Option<Arc<dyn AgentDispatcher>>,
    remote: Arc<dyn AgentDispatcher>,
}

impl RoutingDispatcher {
    pub fn new(
        local_hosts: Vec<String>,
        local: Option<Arc<dyn AgentDispatcher>>,
        remote: Arc<dyn AgentDispatcher>,
    ) -> Self {
        Self {
            local_hosts,
            local,
            remote,
        }
    }

    fn route(&self, host: &str) -> &Arc<dyn AgentDispatcher> {
        match &self.local {
            Some(local) if self.local_hosts.iter().any(|h| h == host) => local,
            _ => &self.remote,
        }
    }
}

#[async_trait]
impl AgentDispatcher for RoutingDispatcher {
    async fn dispatch(&self, job: NodeTransferJob) -> NodeTransferJob {
        let dispatcher = self.route(&job.target_host).clone();
        dispatcher.dispatch(job).await
    }

    async fn cleanup(&self, job: &NodeTransferJob) -> Result<()> {
        self.route(&job.target_host).cleanup(job).await
    }
}

/// Last stdout line that parses as a job report
fn parse_report(stdout: &str) -> Option<NodeTransferJob> {
    stdout
        .lines()
        .rev()
        .filter(|line| !line.trim().is_empty())
        .find_map(|line| serde_json::from_str(line.trim()).ok())
}

/// Quote a word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ArtifactId, Checksum, Manifest};
    use crate::node::JobStatus;
    use chrono::Utc;
    use std::path::PathBuf;

    fn job(host: &str) -> NodeTransferJob {
        let manifest = Manifest {
            artifact_id: ArtifactId::new("img-1").unwrap(),
            checksum: Checksum::parse("abc123").unwrap(),
            source_path: PathBuf::from("/srv/img-1"),
            announce: "http://seed:6969/announce".to_string(),
            size: 0,
            source_format: None,
            descriptor: None,
            created_at: Utc::now(),
        };
        NodeTransferJob::new(
            host,
            manifest,
            "http://seed/img-1.manifest.json",
            PathBuf::from("/var/lib/images/img 1.raw"),
        )
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("agent"), "agent");
        assert_eq!(shell_quote("/a b"), "'/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_ssh_command() {
        let remote = RemoteSettings {
            user: Some("deploy".to_string()),
            port: Some(2222),
            identity: Some(PathBuf::from("/keys/id")),
            options: vec![],
            ..Default::default()
        };
        let dispatcher = SshDispatcher::new(remote, Some("raw".to_string()));
        let job = job("host1");

        let argv = dispatcher.command("host1", &dispatcher.job_args("agent", &job));
        assert_eq!(
            argv[..8],
            ["ssh", "-p", "2222", "-i", "/keys/id", "-l", "deploy", "host1"]
        );
        assert_eq!(
            argv[8],
            "flotilla agent --manifest-uri http://seed/img-1.manifest.json \
             --dest '/var/lib/images/img 1.raw' --target-format raw"
        );

        let cleanup = dispatcher.command("host1", &dispatcher.job_args("agent-cleanup", &job));
        assert!(!cleanup[8].contains("--target-format"));
    }

    #[test]
    fn test_parse_report_takes_last_json_line() {
        let mut reported = job("host1");
        reported.skip().unwrap();
        let stdout = format!(
            "motd banner\n{}\n\n",
            serde_json::to_string(&reported).unwrap()
        );

        let parsed = parse_report(&stdout).unwrap();
        assert!(parsed.is_done());
        assert!(parsed.skipped);
        assert!(parse_report("no report here").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_without_report_fails_job() {
        // `true` ignores its arguments and prints nothing
        let remote = RemoteSettings {
            ssh_program: "true".to_string(),
            options: vec![],
            ..Default::default()
        };
        let dispatcher = SshDispatcher::new(remote, None);

        let job = dispatcher.dispatch(job("host1")).await;
        assert!(matches!(
            job.status,
            JobStatus::Failed(ref f) if f.kind == FailureKind::Remote
        ));
    }

    fn fake_ssh(script: &str) -> RemoteSettings {
        // Runs as `sh -c <script> fake-ssh <host> <remote command>`
        RemoteSettings {
            ssh_program: "sh".to_string(),
            options: vec!["-c".to_string(), script.to_string(), "fake-ssh".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_cleanup_runs_agent_cleanup_on_host() {
        let script = r#"case "$1 $2" in "host1 flotilla agent-cleanup "*) exit 0 ;; esac; exit 3"#;
        let dispatcher = SshDispatcher::new(fake_ssh(script), Some("raw".to_string()));
        dispatcher.cleanup(&job("host1")).await.unwrap();

        let err = dispatcher.cleanup(&job("host2")).await.unwrap_err();
        assert!(matches!(err, FlotillaError::Remote(_)));
    }

    #[tokio::test]
    async fn test_dispatch_parses_report() {
        let mut reported = job("host1");
        reported.skip().unwrap();
        let line = serde_json::to_string(&reported).unwrap();
        let remote = RemoteSettings {
            ssh_program: "sh".to_string(),
            options: vec!["-c".to_string(), format!("echo '{}'", line), "sh".to_string()],
            ..Default::default()
        };
        let dispatcher = SshDispatcher::new(remote, None);

        let job = dispatcher.dispatch(job("host1")).await;
        assert!(job.is_done());
        assert!(job.skipped);
    }
}
