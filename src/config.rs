//! Fleet configuration
//!
//! Loaded from a YAML file (`--config`, or `fleet.yaml` in the user config
//! directory), with remote-shell credentials taken from the environment.

use crate::error::{FlotillaError, Result};
use crate::exec::CommandTemplate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable holding the remote shell user
pub const ENV_SSH_USER: &str = "FLOTILLA_SSH_USER";
/// Environment variable holding the remote shell identity file
pub const ENV_SSH_IDENTITY: &str = "FLOTILLA_SSH_IDENTITY";
/// Environment variable holding the remote shell port
pub const ENV_SSH_PORT: &str = "FLOTILLA_SSH_PORT";

/// Inclusive TCP port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// Create a range, rejecting inverted bounds
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 || start > end {
            return Err(FlotillaError::Config(format!(
                "invalid port range {}-{}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = FlotillaError;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| FlotillaError::Config(format!("invalid port in range: {}", s)))
        };
        match s.split_once(['-', ':']) {
            Some((start, end)) => PortRange::new(parse(start)?, parse(end)?),
            None => {
                let port = parse(s)?;
                PortRange::new(port, port)
            }
        }
    }
}

impl TryFrom<String> for PortRange {
    type Error = FlotillaError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PortRange> for String {
    fn from(range: PortRange) -> Self {
        range.to_string()
    }
}

/// Seed-host swarm settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmSettings {
    /// Tracker listen port
    pub tracker_port: u16,
    /// Seeder listen port
    pub seed_port: u16,
    /// Peer ports opened on target hosts while fetching
    pub peer_ports: PortRange,
    /// Directory the manifest descriptors are written to
    pub publish_dir: PathBuf,
    /// Base URL under which `publish_dir` is reachable by the nodes.
    /// Falls back to a `file://` URI when unset.
    pub publish_base_url: Option<String>,
    /// Directory holding seeder/tracker pid files
    pub state_dir: PathBuf,
    /// Directory holding source images on the seed host
    pub image_dir: PathBuf,
    /// Grace period after SIGTERM before escalating to SIGKILL
    pub stop_grace_secs: u64,
    /// How long a started daemon has to bind its listen port
    pub startup_timeout_secs: u64,
    /// Require the tracker and seeder to bind their ports before seeding
    /// counts as started
    pub await_port: bool,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        let base = default_data_dir();
        Self {
            tracker_port: 6969,
            seed_port: 6881,
            peer_ports: PortRange {
                start: 6881,
                end: 6999,
            },
            publish_dir: base.join("published"),
            publish_base_url: None,
            state_dir: base.join("state"),
            image_dir: base.join("images"),
            stop_grace_secs: 10,
            startup_timeout_secs: 10,
            await_port: true,
        }
    }
}

/// Target-node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Final image directory on each node
    pub dest_dir: PathBuf,
    /// Transient download directory on each node
    pub staging_dir: PathBuf,
    /// Image format the local runtime expects (no conversion when unset)
    pub target_format: Option<String>,
    /// Mode applied to promoted images
    pub mode: u32,
    /// Owner uid applied to promoted images
    pub owner: Option<u32>,
    /// Owner gid applied to promoted images
    pub group: Option<u32>,
    /// Re-check the promotion stamp before skipping an existing image
    pub verify_existing: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            dest_dir: PathBuf::from("/var/lib/libvirt/images"),
            staging_dir: std::env::temp_dir().join("flotilla"),
            target_format: None,
            mode: 0o644,
            owner: None,
            group: None,
            verify_existing: false,
        }
    }
}

/// Command templates for the external tools
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    /// Fetch an artifact: `{descriptor}`, `{dest_dir}`, `{dest}`, `{announce}`
    pub transfer: CommandTemplate,
    /// Tracker daemon: `{port}`, `{data_dir}`
    pub tracker: CommandTemplate,
    /// Seeding daemon: `{port}`, `{data_dir}`, `{descriptor}`, `{source}`
    pub seeder: CommandTemplate,
    /// Build the swarm descriptor: `{source}`, `{announce}`, `{descriptor}`
    pub make_descriptor: Option<CommandTemplate>,
    /// Image conversion: `{src}`, `{dst}`, `{from}`, `{to}`
    pub converter: CommandTemplate,
    /// Firewall rule existence check: `{ports}`
    pub firewall_check: CommandTemplate,
    /// Firewall rule insert: `{ports}`
    pub firewall_allow: CommandTemplate,
    /// Firewall rule delete: `{ports}`
    pub firewall_revoke: CommandTemplate,
}

impl Default for ToolSettings {
    fn default() -> Self {
        let iptables = |op: &str| {
            CommandTemplate::new([
                "iptables", op, "INPUT", "-p", "tcp", "--match", "multiport", "--dports",
                "{ports}", "-j", "ACCEPT",
            ])
        };

        Self {
            transfer: CommandTemplate::new([
                "aria2c",
                "--seed-time=0",
                "--allow-overwrite=true",
                "--dir={dest_dir}",
                "{descriptor}",
            ]),
            tracker: CommandTemplate::new([
                "bttrack",
                "--port",
                "{port}",
                "--dfile",
                "{data_dir}/dstate",
            ]),
            seeder: CommandTemplate::new([
                "aria2c",
                "--seed-ratio=0.0",
                "--check-integrity=true",
                "--listen-port={port}",
                "--dir={data_dir}",
                "{descriptor}",
            ]),
            make_descriptor: Some(CommandTemplate::new([
                "mktorrent",
                "-a",
                "{announce}",
                "-o",
                "{descriptor}",
                "{source}",
            ])),
            converter: CommandTemplate::new([
                "qemu-img", "convert", "-f", "{from}", "-O", "{to}", "{src}", "{dst}",
            ]),
            firewall_check: iptables("-C"),
            firewall_allow: iptables("-I"),
            firewall_revoke: iptables("-D"),
        }
    }
}

/// Remote shell settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// Remote shell program
    pub ssh_program: String,
    /// Remote user (overridden by `FLOTILLA_SSH_USER`)
    pub user: Option<String>,
    /// Identity file (overridden by `FLOTILLA_SSH_IDENTITY`)
    pub identity: Option<PathBuf>,
    /// Remote shell port (overridden by `FLOTILLA_SSH_PORT`)
    pub port: Option<u16>,
    /// Extra options passed verbatim to the remote shell
    pub options: Vec<String>,
    /// Path of the agent binary on the target hosts
    pub agent_path: String,
    /// Hosts handled by the in-process agent instead of the remote shell
    pub local_hosts: Vec<String>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            user: None,
            identity: None,
            port: None,
            options: vec![
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
            ],
            agent_path: "flotilla".to_string(),
            local_hosts: vec!["localhost".to_string(), "127.0.0.1".to_string()],
        }
    }
}

/// Complete fleet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Named host groups
    pub groups: BTreeMap<String, Vec<String>>,
    /// Seed-host settings
    pub swarm: SwarmSettings,
    /// Target-node settings
    pub node: NodeSettings,
    /// External tool command lines
    pub tools: ToolSettings,
    /// Remote shell settings
    pub remote: RemoteSettings,
    /// Default per-node timeout in seconds
    pub per_node_timeout_secs: u64,
    /// Default global run timeout in seconds
    pub global_timeout_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            groups: BTreeMap::new(),
            swarm: SwarmSettings::default(),
            node: NodeSettings::default(),
            tools: ToolSettings::default(),
            remote: RemoteSettings::default(),
            per_node_timeout_secs: 900,
            global_timeout_secs: 3600,
        }
    }
}

impl FleetConfig {
    /// Load configuration from an explicit path, the default path, or defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a YAML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FlotillaError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse YAML config content
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: FleetConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Override remote credentials from the environment
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(user) = lookup(ENV_SSH_USER) {
            self.remote.user = Some(user);
        }
        if let Some(identity) = lookup(ENV_SSH_IDENTITY) {
            self.remote.identity = Some(PathBuf::from(identity));
        }
        if let Some(port) = lookup(ENV_SSH_PORT) {
            let port = port.parse().map_err(|_| {
                FlotillaError::Config(format!("{} is not a port: {}", ENV_SSH_PORT, port))
            })?;
            self.remote.port = Some(port);
        }
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.swarm.tracker_port == self.swarm.seed_port {
            return Err(FlotillaError::Config(
                "tracker_port and seed_port must differ".to_string(),
            ));
        }
        if self.node.mode > 0o7777 {
            return Err(FlotillaError::Config(format!(
                "invalid file mode {:o}",
                self.node.mode
            )));
        }
        Ok(())
    }

    /// Resolve a `--targets` value to a deduplicated host list.
    ///
    /// A configured group name expands to its hosts; a comma-separated
    /// value is taken as a literal host list. Naming this host under more
    /// than one local alias is rejected, since those jobs would share one
    /// destination.
    pub fn resolve_targets(&self, targets: &str) -> Result<Vec<String>> {
        let hosts: Vec<String> = if let Some(group) = self.groups.get(targets) {
            group.clone()
        } else if targets.contains(',') {
            targets.split(',').map(|h| h.trim().to_string()).collect()
        } else {
            return Err(FlotillaError::Config(format!(
                "unknown host group: {}",
                targets
            )));
        };

        let mut seen = std::collections::HashSet::new();
        let hosts: Vec<String> = hosts
            .into_iter()
            .filter(|h| !h.is_empty() && seen.insert(h.clone()))
            .collect();

        if hosts.is_empty() {
            return Err(FlotillaError::Config(format!(
                "host group {} is empty",
                targets
            )));
        }

        let local: Vec<&str> = hosts
            .iter()
            .filter(|h| self.remote.local_hosts.contains(h))
            .map(String::as_str)
            .collect();
        if local.len() > 1 {
            return Err(FlotillaError::Config(format!(
                "targets {} all name this host",
                local.join(", ")
            )));
        }

        Ok(hosts)
    }
}

/// Default data directory for seed-host state
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("flotilla")
}

/// Default config file location
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("flotilla").join("fleet.yaml"))
}
