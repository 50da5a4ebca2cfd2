use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::action::StageReport;
use crate::config::Config;
use crate::error::Result;
use crate::host::{Host, OsRelease};

/// The five provisioning stages, in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    Hardening,
    Docker,
    Wireguard,
    Monitoring,
    Alerting,
}

impl StageId {
    pub const ALL: [StageId; 5] = [
        StageId::Hardening,
        StageId::Docker,
        StageId::Wireguard,
        StageId::Monitoring,
        StageId::Alerting,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageId::Hardening => "hardening",
            StageId::Docker => "docker",
            StageId::Wireguard => "wireguard",
            StageId::Monitoring => "monitoring",
            StageId::Alerting => "alerting",
        }
    }

    /// 1-based position in the pipeline.
    pub fn ordinal(&self) -> u8 {
        match self {
            StageId::Hardening => 1,
            StageId::Docker => 2,
            StageId::Wireguard => 3,
            StageId::Monitoring => 4,
            StageId::Alerting => 5,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StageId::Hardening => {
                "SSH lockdown, admin account, firewall, intrusion blocking, automatic updates"
            }
            StageId::Docker => "Docker engine from the upstream repository with log rotation",
            StageId::Wireguard => "WireGuard server, client profile and NAT",
            StageId::Monitoring => "node_exporter, cAdvisor, Prometheus and Grafana on the VPN",
            StageId::Alerting => "Alertmanager email notifications and alert rules",
        }
    }

    pub fn depends_on(&self) -> &'static [StageId] {
        match self {
            StageId::Hardening => &[],
            StageId::Docker => &[StageId::Hardening],
            StageId::Wireguard => &[StageId::Hardening],
            StageId::Monitoring => &[StageId::Hardening, StageId::Docker, StageId::Wireguard],
            StageId::Alerting => &[StageId::Monitoring],
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        StageId::ALL
            .into_iter()
            .find(|id| id.name() == wanted || id.ordinal().to_string() == wanted)
            .ok_or_else(|| {
                let names: Vec<&str> = StageId::ALL.iter().map(StageId::name).collect();
                format!("unknown stage '{s}' (expected one of: {})", names.join(", "))
            })
    }
}

/// Everything a stage needs to act on the host.
pub struct StageContext<'c> {
    pub host: &'c Host<'c>,
    pub config: &'c Config,
    pub os: &'c OsRelease,
}

pub trait Stage {
    fn id(&self) -> StageId;

    /// Check on-disk artifacts of earlier stages before the stage mutates
    /// anything. Most stages have nothing meaningful to check.
    fn verify_dependencies(&self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    fn run(&self, ctx: &StageContext, report: &mut StageReport) -> Result<()>;
}
