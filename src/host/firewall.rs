//! Local firewall allowances

use crate::config::PortRange;
use crate::error::{FlotillaError, Result};
use crate::exec::{self, CommandTemplate};
use async_trait::async_trait;

/// Port allowances on the local host. Both operations are idempotent.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Open the given port range; a rule that already exists is left alone
    async fn allow(&self, ports: PortRange) -> Result<()>;

    /// Close the given port range; a missing rule is not an error
    async fn revoke(&self, ports: PortRange) -> Result<()>;
}

/// Firewall driven by check/insert/delete command templates
pub struct CommandFirewall {
    check: CommandTemplate,
    allow: CommandTemplate,
    revoke: CommandTemplate,
}

impl CommandFirewall {
    pub fn new(check: CommandTemplate, allow: CommandTemplate, revoke: CommandTemplate) -> Self {
        Self {
            check,
            allow,
            revoke,
        }
    }

    fn ports_arg(ports: PortRange) -> String {
        // iptables multiport syntax
        format!("{}:{}", ports.start, ports.end)
    }

    async fn rule_present(&self, ports: &str) -> Result<bool> {
        let argv = self.check.render(&[("ports", ports)])?;
        let output = exec::run(&argv).await?;
        Ok(output.success())
    }

    async fn apply(&self, template: &CommandTemplate, ports: &str) -> Result<()> {
        let argv = template.render(&[("ports", ports)])?;
        let output = exec::run(&argv).await?;
        if output.success() {
            Ok(())
        } else {
            Err(FlotillaError::Firewall(format!(
                "{} failed with {}",
                argv.join(" "),
                output.describe()
            )))
        }
    }
}

#[async_trait]
impl Firewall for CommandFirewall {
    async fn allow(&self, ports: PortRange) -> Result<()> {
        let ports = Self::ports_arg(ports);
        if self.rule_present(&ports).await? {
            tracing::debug!(ports = %ports, "firewall allowance already present");
            return Ok(());
        }
        self.apply(&self.allow, &ports).await
    }

    async fn revoke(&self, ports: PortRange) -> Result<()> {
        let ports = Self::ports_arg(ports);
        if !self.rule_present(&ports).await? {
            tracing::debug!(ports = %ports, "firewall allowance already revoked");
            return Ok(());
        }
        self.apply(&self.revoke, &ports).await
    }
}
