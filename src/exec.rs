//! External command execution
//!
//! Every external capability (transfer client, tracker, seeder, firewall,
//! image converter, remote shell) is driven through a [`CommandTemplate`]
//! rendered with per-call placeholders and run as a child process that is
//! killed when its future is dropped.

use crate::error::{FlotillaError, Result};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Command line with `{placeholder}` tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(Vec<String>);

impl CommandTemplate {
    /// Create a template from its argv parts
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Substitute placeholders and return the argv to execute.
    ///
    /// A placeholder left unresolved after substitution is a configuration
    /// error, so a typo in a config file fails before anything is spawned.
    pub fn render(&self, vars: &[(&str, &str)]) -> Result<Vec<String>> {
        if self.0.is_empty() {
            return Err(FlotillaError::Config("empty command template".to_string()));
        }

        let mut argv = Vec::with_capacity(self.0.len());
        for part in &self.0 {
            let mut rendered = part.clone();
            for (key, value) in vars {
                rendered = rendered.replace(&format!("{{{}}}", key), value);
            }
            if let Some(start) = rendered.find('{') {
                if let Some(len) = rendered[start..].find('}') {
                    return Err(FlotillaError::Config(format!(
                        "unresolved placeholder {} in command template",
                        &rendered[start..start + len + 1]
                    )));
                }
            }
            argv.push(rendered);
        }

        Ok(argv)
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal)
    pub code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status zero
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Short diagnostic for error messages
    pub fn describe(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit code {}", self.code)
        } else {
            format!("exit code {}: {}", self.code, stderr)
        }
    }
}

fn build(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| FlotillaError::Config("empty command line".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);
    Ok(cmd)
}

/// Run a command to completion, capturing its output.
///
/// The child is killed if the returned future is dropped, which is how
/// per-node timeouts cancel blocking transfers and conversions.
pub async fn run(argv: &[String]) -> Result<CommandOutput> {
    tracing::debug!(command = %argv.join(" "), "running command");

    let child = build(argv)?
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| FlotillaError::Internal(format!("failed to spawn {}: {}", argv[0], e)))?;

    let output = child.wait_with_output().await?;

    Ok(CommandOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Spawn a long-running daemon with its output discarded
pub fn spawn_daemon(argv: &[String]) -> Result<Child> {
    tracing::debug!(command = %argv.join(" "), "spawning daemon");

    let mut cmd = build(argv)?;
    // Daemons outlive the spawning future; teardown stops them by pid.
    cmd.kill_on_drop(false)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    cmd.spawn()
        .map_err(|e| FlotillaError::Startup(format!("failed to spawn {}: {}", argv[0], e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_placeholders() {
        let template = CommandTemplate::new(["aria2c", "--dir={dest_dir}", "{descriptor}"]);
        let argv = template
            .render(&[("dest_dir", "/var/tmp"), ("descriptor", "img-1.torrent")])
            .unwrap();
        assert_eq!(argv, vec!["aria2c", "--dir=/var/tmp", "img-1.torrent"]);
    }

    #[test]
    fn test_render_rejects_unresolved_placeholder() {
        let template = CommandTemplate::new(["qemu-img", "convert", "{src}", "{dst}"]);
        let err = template.render(&[("src", "a.qcow2")]).unwrap_err();
        assert!(matches!(err, FlotillaError::Config(_)));
    }

    #[test]
    fn test_render_rejects_empty_template() {
        let template = CommandTemplate::new(Vec::<String>::new());
        assert!(template.render(&[]).is_err());
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let output = run(&["sh".into(), "-c".into(), "echo hello; exit 3".into()])
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.code, 3);
        assert!(!output.success());
    }
}
