//! Tracker and seeder daemon control
//!
//! Daemons are spawned detached and tracked through pid files in the state
//! directory, so a later run can find and reclaim processes left behind by
//! a crashed one. A pid file records the process start time next to the pid;
//! a pid that has since been reused by another process is never signalled.

use crate::error::{FlotillaError, Result};
use crate::exec::{self, CommandTemplate};
use crate::manifest::ArtifactId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_WAIT: Duration = Duration::from_secs(5);
/// How long a daemon that is not port-checked must survive after spawning
const STARTUP_SETTLE: Duration = Duration::from_millis(250);

/// Send a signal to a process
fn kill(pid: i32, signal: i32) -> io::Result<()> {
    let result = unsafe { libc::kill(pid, signal) };
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Check if a process exists.
///
/// Exited children of this process are reaped first so they do not linger
/// as zombies that still answer signal 0.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe {
        libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG);
    }
    match kill(pid, 0) {
        Ok(()) => true,
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}

async fn wait_exit(pid: i32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Kernel start time of a process, in clock ticks since boot
pub fn start_time(pid: i32) -> Option<u64> {
    if pid <= 0 {
        return None;
    }
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name may contain spaces and parentheses; fields resume
    // after the last ')' starting with field 3
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}

/// A process as recorded in a pid or lease file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Process ID
    pub pid: i32,
    /// Start time, absent on systems without procfs
    pub start_time: Option<u64>,
}

impl ProcessRecord {
    /// Record a running process
    pub fn of(pid: i32) -> Self {
        Self {
            pid,
            start_time: start_time(pid),
        }
    }

    /// Record this process
    pub fn current() -> Self {
        Self::of(std::process::id() as i32)
    }

    /// Parse the `<pid> [<start time>]` line of a pid file
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let pid = fields.next()?.parse::<i32>().ok().filter(|pid| *pid > 0)?;
        let start_time = match fields.next() {
            Some(field) => Some(field.parse().ok()?),
            None => None,
        };
        Some(Self { pid, start_time })
    }

    /// Whether the recorded process is still the one running under its pid
    pub fn is_running(&self) -> bool {
        if !is_alive(self.pid) {
            return false;
        }
        match (self.start_time, start_time(self.pid)) {
            (Some(recorded), Some(actual)) => recorded == actual,
            // No procfs here, the pid is all there is to go on
            (None, None) => true,
            _ => false,
        }
    }

    /// Whether this record describes the calling process
    pub fn is_self(&self) -> bool {
        self.pid == std::process::id() as i32
    }
}

impl fmt::Display for ProcessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start_time {
            Some(start) => write!(f, "{} {}", self.pid, start),
            None => write!(f, "{}", self.pid),
        }
    }
}

/// Stop a process: SIGTERM, bounded wait, then SIGKILL.
///
/// Returns false when the process was already gone. Errors only if the
/// process is still alive after SIGKILL.
pub async fn terminate(pid: i32, grace: Duration) -> Result<bool> {
    if !is_alive(pid) {
        return Ok(false);
    }

    debug!(pid, "sending SIGTERM");
    if let Err(e) = kill(pid, libc::SIGTERM) {
        if e.raw_os_error() == Some(libc::ESRCH) {
            return Ok(false);
        }
        return Err(FlotillaError::Startup(format!("cannot signal {}: {}", pid, e)));
    }
    if wait_exit(pid, grace).await {
        return Ok(true);
    }

    warn!(pid, "process ignored SIGTERM, sending SIGKILL");
    if let Err(e) = kill(pid, libc::SIGKILL) {
        if e.raw_os_error() != Some(libc::ESRCH) {
            return Err(FlotillaError::Startup(format!("cannot kill {}: {}", pid, e)));
        }
    }
    if wait_exit(pid, KILL_WAIT).await {
        Ok(true)
    } else {
        Err(FlotillaError::Startup(format!(
            "process {} still running after SIGKILL",
            pid
        )))
    }
}

/// Check that nothing is listening on a port
pub fn port_available(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Handle to a running daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonHandle {
    /// Process ID
    pub pid: u32,
    /// Pid file recording the process
    pub pid_file: PathBuf,
    /// Listen port
    pub port: u16,
}

/// Per-launch values substituted into a daemon's command template
#[derive(Debug, Clone)]
pub struct Launch<'a> {
    pub artifact: &'a ArtifactId,
    pub port: u16,
    pub data_dir: &'a Path,
    pub source: &'a Path,
    pub descriptor: Option<&'a Path>,
    pub announce: &'a str,
}

/// A tracker or seeder process driven by a command template
#[derive(Debug, Clone)]
pub struct DaemonProcess {
    /// Role name, used in pid file names and logs
    role: String,
    template: CommandTemplate,
    state_dir: PathBuf,
    grace: Duration,
    /// Bound on the wait for the listen port after spawning
    startup: Duration,
    /// Require the listen port to be bound before the start succeeds
    await_port: bool,
}

impl DaemonProcess {
    /// Create a daemon controller
    pub fn new(role: &str, template: CommandTemplate, state_dir: PathBuf, grace: Duration) -> Self {
        Self {
            role: role.to_string(),
            template,
            state_dir,
            grace,
            startup: Duration::from_secs(10),
            await_port: true,
        }
    }

    /// Set the startup window and whether the listen port is checked
    pub fn with_startup(mut self, startup: Duration, await_port: bool) -> Self {
        self.startup = startup;
        self.await_port = await_port;
        self
    }

    /// Role name
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Pid file for this daemon and artifact
    pub fn pid_file(&self, artifact: &ArtifactId) -> PathBuf {
        self.state_dir.join(format!("{}.{}.pid", artifact, self.role))
    }

    /// Process recorded by a previous start, if any
    pub fn recorded(&self, artifact: &ArtifactId) -> Result<Option<ProcessRecord>> {
        let path = self.pid_file(artifact);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match ProcessRecord::parse(&content) {
            Some(record) => Ok(Some(record)),
            None => {
                warn!(path = %path.display(), "ignoring malformed pid file");
                Ok(None)
            }
        }
    }

    /// Start the daemon and record its pid.
    ///
    /// The daemon must stay up and bind its port within the startup window,
    /// otherwise it is stopped and the start fails.
    pub async fn start(&self, launch: &Launch<'_>) -> Result<DaemonHandle> {
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::create_dir_all(launch.data_dir)?;

        let port = launch.port.to_string();
        let data_dir = launch.data_dir.to_string_lossy();
        let source = launch.source.to_string_lossy();
        let descriptor = launch
            .descriptor
            .map(|d| d.to_string_lossy().to_string())
            .unwrap_or_default();
        let argv = self.template.render(&[
            ("artifact", launch.artifact.as_str()),
            ("port", &port),
            ("data_dir", &data_dir),
            ("source", &source),
            ("descriptor", &descriptor),
            ("announce", launch.announce),
        ])?;

        let child = exec::spawn_daemon(&argv)?;
        let pid = child.id().ok_or_else(|| {
            FlotillaError::Startup(format!("{} exited immediately", self.role))
        })?;

        let pid_file = self.pid_file(launch.artifact);
        let record = ProcessRecord::of(pid as i32);
        std::fs::write(&pid_file, format!("{}\n", record))?;

        if let Err(e) = self.await_ready(record, launch.port).await {
            if let Err(stop_err) = self.stop(launch.artifact).await {
                warn!(role = %self.role, "failed to stop daemon: {}", stop_err);
            }
            return Err(e);
        }

        info!(role = %self.role, pid, port = launch.port, "daemon started");
        Ok(DaemonHandle {
            pid,
            pid_file,
            port: launch.port,
        })
    }

    /// Wait until the daemon listens on its port, failing if it exits
    async fn await_ready(&self, record: ProcessRecord, port: u16) -> Result<()> {
        let window = if self.await_port {
            self.startup
        } else {
            STARTUP_SETTLE.min(self.startup)
        };
        let deadline = Instant::now() + window;
        loop {
            if !record.is_running() {
                return Err(FlotillaError::Startup(format!(
                    "{} exited during startup",
                    self.role
                )));
            }
            if self.await_port && !port_available(port) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                if !self.await_port {
                    return Ok(());
                }
                return Err(FlotillaError::Startup(format!(
                    "{} did not bind port {} within {:?}",
                    self.role, port, self.startup
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stop the daemon recorded for an artifact and remove its pid file.
    ///
    /// A daemon that is already gone is a valid terminal state, as is a pid
    /// that now belongs to a different process. Returns whether a live
    /// process was stopped.
    pub async fn stop(&self, artifact: &ArtifactId) -> Result<bool> {
        let stopped = match self.recorded(artifact)? {
            Some(record) if record.is_running() => terminate(record.pid, self.grace).await?,
            Some(record) => {
                debug!(role = %self.role, pid = record.pid, "recorded process is gone");
                false
            }
            None => false,
        };

        match std::fs::remove_file(self.pid_file(artifact)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if stopped {
            info!(role = %self.role, artifact = %artifact, "daemon stopped");
        }
        Ok(stopped)
    }
}
