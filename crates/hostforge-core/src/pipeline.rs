//! Pipeline driver: preconditions, ordered stage execution, summary.

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::action::{Outcome, StageReport};
use crate::config::{Config, WarnLevel};
use crate::error::ProvisionError;
use crate::host::{self, Host, OsRelease};
use crate::stage::{StageContext, StageId};
use crate::stages::{alerting, stage_for, wireguard};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("precondition failed")]
    Precondition(#[source] ProvisionError),

    #[error("configuration is invalid: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("stage {} ({}) failed", .stage.ordinal(), .stage)]
    StageFailed {
        stage: StageId,
        #[source]
        source: ProvisionError,
    },
}

impl PipelineError {
    /// The stage that failed, if the failure happened inside one.
    pub fn stage(&self) -> Option<StageId> {
        match self {
            PipelineError::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub os: OsRelease,
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    pub fn stage(&self, id: StageId) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == id)
    }

    pub fn warnings(&self) -> impl Iterator<Item = (StageId, &str)> {
        self.stages
            .iter()
            .flat_map(|r| r.warnings.iter().map(move |w| (r.stage, w.as_str())))
    }
}

pub struct Pipeline<'a> {
    host: &'a Host<'a>,
    config: &'a Config,
}

impl<'a> Pipeline<'a> {
    pub fn new(host: &'a Host<'a>, config: &'a Config) -> Self {
        Self { host, config }
    }

    /// Configuration errors, privileged identity and supported platform.
    /// Nothing on the host is modified before these pass.
    pub fn preflight(&self) -> Result<OsRelease, PipelineError> {
        let errors: Vec<String> = self
            .config
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if !errors.is_empty() {
            return Err(PipelineError::InvalidConfig(errors));
        }
        host::require_elevated_privileges(self.host).map_err(PipelineError::Precondition)?;
        let os = host::require_supported_platform(self.host).map_err(PipelineError::Precondition)?;
        info!(platform = %os.pretty_name, "preconditions met");
        Ok(os)
    }

    /// Run every stage in order, stopping at the first failure.
    pub fn run_all(&self) -> Result<PipelineReport, PipelineError> {
        let os = self.preflight()?;
        let mut report = PipelineReport {
            os,
            stages: Vec::new(),
        };
        for id in StageId::ALL {
            let stage_report = self.execute(id, &report.os)?;
            report.stages.push(stage_report);
        }
        info!("all {} stages complete", StageId::ALL.len());
        Ok(report)
    }

    /// Run one stage. Dependencies are not run; the stage checks for the
    /// artifacts it needs from them.
    pub fn run_single(&self, id: StageId) -> Result<PipelineReport, PipelineError> {
        let os = self.preflight()?;
        let stage_report = self.execute(id, &os)?;
        Ok(PipelineReport {
            os,
            stages: vec![stage_report],
        })
    }

    fn execute(&self, id: StageId, os: &OsRelease) -> Result<StageReport, PipelineError> {
        let ctx = StageContext {
            host: self.host,
            config: self.config,
            os,
        };
        let stage = stage_for(id);
        let mut report = StageReport::new(id);
        info!(stage = %id, "stage {}/{}: {}", id.ordinal(), StageId::ALL.len(), id.description());

        let result = stage
            .verify_dependencies(&ctx)
            .and_then(|()| stage.run(&ctx, &mut report));
        if let Err(source) = result {
            error!(stage = %id, error = %source, "stage failed");
            return Err(PipelineError::StageFailed { stage: id, source });
        }
        info!(
            stage = %id,
            applied = report.count(Outcome::Applied),
            skipped = report.count(Outcome::Skipped),
            warnings = report.warnings.len(),
            "stage done"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Connection summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SummaryItem {
    pub label: String,
    pub value: String,
}

fn item(label: &str, value: String) -> SummaryItem {
    SummaryItem {
        label: label.to_string(),
        value,
    }
}

/// What the operator needs to reach the host after the stages in `report`.
pub fn summary(config: &Config, report: &PipelineReport) -> Vec<SummaryItem> {
    let mut items = Vec::new();
    let detected = report
        .stage(StageId::Wireguard)
        .and_then(|vpn| vpn.outputs.get("endpoint"))
        .and_then(|endpoint| endpoint.rsplit_once(':'))
        .map(|(addr, _)| addr.to_string());
    let server = config
        .vpn
        .public_ip
        .clone()
        .or(detected)
        .unwrap_or_else(|| "<server>".to_string());
    let vpn_ip = config.vpn.server_ip;
    let m = &config.monitoring;

    if report.stage(StageId::Hardening).is_some() {
        items.push(item(
            "SSH",
            format!("ssh -p {} {}@{server}", config.ssh_port, config.admin_user),
        ));
    }
    if report.stage(StageId::Docker).is_some() {
        items.push(item(
            "Docker",
            format!("log out and back in as {} to use docker without sudo", config.admin_user),
        ));
    }
    if let Some(vpn) = report.stage(StageId::Wireguard) {
        let endpoint = vpn
            .outputs
            .get("endpoint")
            .cloned()
            .unwrap_or_else(|| format!("{server}:{}", config.vpn.port));
        let client = vpn
            .outputs
            .get("client_config")
            .cloned()
            .unwrap_or_else(|| wireguard::client_config_path(&config.vpn.client_name));
        items.push(item("VPN endpoint", format!("{endpoint}/udp")));
        items.push(item("VPN client config", client));
        items.push(item("VPN QR code", "hostforge vpn client-qr".to_string()));
    }
    if report.stage(StageId::Monitoring).is_some() {
        items.push(item(
            "Grafana",
            format!("http://{vpn_ip}:{} (user {})", m.grafana_port, m.grafana_admin_user),
        ));
        items.push(item("Prometheus", format!("http://{vpn_ip}:{}", m.prometheus_port)));
        items.push(item(
            "node_exporter",
            format!("http://{vpn_ip}:{}/metrics", m.node_exporter_port),
        ));
        items.push(item("cAdvisor", format!("http://{vpn_ip}:{}", m.cadvisor_port)));
    }
    if report.stage(StageId::Alerting).is_some() {
        let a = &config.alerting;
        items.push(item(
            "Alertmanager",
            format!("http://{vpn_ip}:{}", a.alertmanager_port),
        ));
        let status = if !alerting::delivers_email(a) || a.smtp_password.is_empty() {
            "not delivering: set SMTP_PASSWORD, ALERT_EMAIL_FROM and ALERT_EMAIL_TO, \
             then re-run the alerting stage"
                .to_string()
        } else {
            format!("email to {} via {}:{}", a.email_to, a.smtp_host, a.smtp_port)
        };
        items.push(item("Alerts", status));
    }
    items
}
