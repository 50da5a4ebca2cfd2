//! ufw rule management.

use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

use crate::config::Ipv4Net;
use crate::error::Result;
use crate::exec::CommandSpec;
use crate::host::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp,
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "subnet", rename_all = "snake_case")]
pub enum Source {
    Anywhere,
    Subnet(String),
}

/// One inbound allow rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirewallRule {
    pub source: Source,
    pub port: u16,
    pub proto: Proto,
    pub comment: String,
}

impl FirewallRule {
    pub fn public(port: u16, proto: Proto, comment: &str) -> Self {
        Self {
            source: Source::Anywhere,
            port,
            proto,
            comment: comment.to_string(),
        }
    }

    pub fn vpn_only(subnet: Ipv4Net, port: u16, comment: &str) -> Self {
        Self {
            source: Source::Subnet(subnet.to_string()),
            port,
            proto: Proto::Tcp,
            comment: comment.to_string(),
        }
    }

    pub fn is_public(&self) -> bool {
        self.source == Source::Anywhere
    }

    /// Rule body as ufw prints it in `ufw show added`, without the comment.
    fn selector(&self) -> Vec<String> {
        match &self.source {
            Source::Anywhere => vec![format!("{}/{}", self.port, self.proto)],
            Source::Subnet(net) => vec![
                "from".to_string(),
                net.clone(),
                "to".to_string(),
                "any".to_string(),
                "port".to_string(),
                self.port.to_string(),
                "proto".to_string(),
                self.proto.to_string(),
            ],
        }
    }

    pub fn added_line(&self) -> String {
        format!("ufw allow {}", self.selector().join(" "))
    }

    fn allow_command(&self) -> CommandSpec {
        CommandSpec::new("ufw")
            .arg("allow")
            .args(self.selector())
            .args(["comment".to_string(), self.comment.clone()])
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let from = match &self.source {
            Source::Anywhere => "anywhere".to_string(),
            Source::Subnet(net) => net.clone(),
        };
        write!(f, "{}/{} from {} ({})", self.port, self.proto, from, self.comment)
    }
}

fn contains_rule(added: &str, rule: &FirewallRule) -> bool {
    let line = rule.added_line();
    added.lines().map(str::trim).any(|l| {
        l == line
            || l.strip_prefix(line.as_str())
                .map(|rest| rest.starts_with(' '))
                .unwrap_or(false)
    })
}

/// Add `rule` unless ufw already has it. Returns true when a rule was added.
pub fn ensure_rule(host: &Host, rule: &FirewallRule) -> Result<bool> {
    let added = host.run(CommandSpec::new("ufw").args(["show", "added"]))?;
    if contains_rule(&added.stdout, rule) {
        debug!(rule = %rule, "firewall rule present");
        return Ok(false);
    }
    host.run(rule.allow_command())?;
    info!(rule = %rule, "firewall rule added");
    Ok(true)
}

pub fn ensure_rules(host: &Host, rules: &[FirewallRule]) -> Result<usize> {
    let mut added = 0;
    for rule in rules {
        if ensure_rule(host, rule)? {
            added += 1;
        }
    }
    Ok(added)
}

/// Default-deny inbound, default-allow outbound.
pub fn set_default_policies(host: &Host) -> Result<()> {
    host.run(CommandSpec::new("ufw").args(["default", "deny", "incoming"]))?;
    host.run(CommandSpec::new("ufw").args(["default", "allow", "outgoing"]))?;
    Ok(())
}

pub fn is_active(host: &Host) -> Result<bool> {
    let status = host.run(CommandSpec::new("ufw").arg("status"))?;
    Ok(status.stdout.contains("Status: active"))
}

/// Enable ufw unless it is already active. Returns true if it was enabled now.
pub fn enable(host: &Host) -> Result<bool> {
    if is_active(host)? {
        return Ok(false);
    }
    host.run(CommandSpec::new("ufw").args(["--force", "enable"]))?;
    info!("firewall enabled");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::testing::{FakeFetcher, FakeRunner};

    fn subnet() -> Ipv4Net {
        "10.8.0.0/24".parse().unwrap()
    }

    #[test]
    fn public_rule_command_line() {
        let rule = FirewallRule::public(2222, Proto::Tcp, "SSH");
        assert_eq!(rule.added_line(), "ufw allow 2222/tcp");
        assert_eq!(rule.allow_command().display(), "ufw allow 2222/tcp comment SSH");
    }

    #[test]
    fn vpn_rule_is_scoped_to_subnet() {
        let rule = FirewallRule::vpn_only(subnet(), 9090, "Prometheus");
        assert!(!rule.is_public());
        assert_eq!(
            rule.added_line(),
            "ufw allow from 10.8.0.0/24 to any port 9090 proto tcp"
        );
    }

    #[test]
    fn existing_rule_is_not_added_again() {
        let runner = FakeRunner::new();
        runner.respond(
            "ufw show added",
            CommandOutput::success(
                "Added user rules (see 'ufw status' for running firewall):\n\
                 ufw allow 2222/tcp comment 'SSH'\n\
                 ufw allow from 10.8.0.0/24 to any port 9090 proto tcp comment 'Prometheus'\n",
            ),
        );
        let fetcher = FakeFetcher::new();
        let host = Host::new(&runner, &fetcher);

        let rules = [
            FirewallRule::public(2222, Proto::Tcp, "SSH"),
            FirewallRule::vpn_only(subnet(), 9090, "Prometheus"),
        ];
        assert_eq!(ensure_rules(&host, &rules).unwrap(), 0);
        assert!(!runner.ran("ufw allow"));
    }

    #[test]
    fn port_prefix_does_not_count_as_present() {
        let added = "ufw allow 22220/tcp\n";
        let rule = FirewallRule::public(2222, Proto::Tcp, "SSH");
        assert!(!contains_rule(added, &rule));
    }

    #[test]
    fn missing_rule_is_added() {
        let runner = FakeRunner::new();
        runner.respond("ufw show added", CommandOutput::success("Added user rules\n"));
        let fetcher = FakeFetcher::new();
        let host = Host::new(&runner, &fetcher);

        let rule = FirewallRule::public(51820, Proto::Udp, "WireGuard");
        assert!(ensure_rule(&host, &rule).unwrap());
        assert!(runner.ran("ufw allow 51820/udp comment WireGuard"));
    }

    #[test]
    fn enable_skips_active_firewall() {
        let runner = FakeRunner::new();
        runner.respond("ufw status", CommandOutput::success("Status: active\n"));
        let fetcher = FakeFetcher::new();
        let host = Host::new(&runner, &fetcher);
        assert!(!enable(&host).unwrap());
        assert!(!runner.ran("ufw --force enable"));
    }
}
