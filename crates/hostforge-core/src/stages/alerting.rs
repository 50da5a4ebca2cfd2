//! Stage 5: Alertmanager with email delivery and the alert rule set.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::action::{AllowRules, EnableService, StageReport, Step, WriteConfig};
use crate::config::{AlertingConfig, Config};
use crate::error::{ProvisionError, Result};
use crate::exec::CommandSpec;
use crate::firewall::FirewallRule;
use crate::host::Host;
use crate::io;
use crate::services;
use crate::stage::{Stage, StageContext, StageId};
use crate::stages::monitoring::{
    chown, ensure_system_user, install_release, prometheus_yml, systemd_unit, ALERT_RULES,
    PROMETHEUS_BIN, PROMETHEUS_YML,
};

pub const ALERTMANAGER_DIR: &str = "/etc/alertmanager";
pub const ALERTMANAGER_YML: &str = "/etc/alertmanager/alertmanager.yml";
pub const ALERTMANAGER_DATA: &str = "/var/lib/alertmanager";
pub const ALERTMANAGER_BIN: &str = "/usr/local/bin/alertmanager";

pub struct Alerting;

impl Stage for Alerting {
    fn id(&self) -> StageId {
        StageId::Alerting
    }

    fn verify_dependencies(&self, ctx: &StageContext) -> Result<()> {
        for path in [PROMETHEUS_YML, PROMETHEUS_BIN] {
            if !ctx.host.exists(path) {
                return Err(ProvisionError::DependencyMissing {
                    stage: StageId::Alerting.to_string(),
                    missing: format!("{path} (installed by the monitoring stage)"),
                });
            }
        }
        Ok(())
    }

    fn run(&self, ctx: &StageContext, report: &mut StageReport) -> Result<()> {
        let host = ctx.host;
        let config = ctx.config;
        let a = &config.alerting;

        ensure_system_user(host, report, "alertmanager")?;
        install_release(
            host,
            report,
            config,
            "prometheus/alertmanager",
            "alertmanager",
            &["alertmanager", "amtool"],
        )?;
        for dir in [ALERTMANAGER_DIR, ALERTMANAGER_DATA] {
            io::ensure_dir(&host.path(dir))?;
        }

        if a.smtp_password.is_empty() {
            report.warn(
                "SMTP_PASSWORD is empty: Alertmanager cannot authenticate to the mail relay",
            );
        }
        if a.email_to.is_empty() {
            report.warn("ALERT_EMAIL_TO is empty: alerts have no recipient");
        }
        if a.email_from.is_empty() {
            report.warn("ALERT_EMAIL_FROM is empty: alerts have no sender address");
        }
        if !delivers_email(a) {
            report.warn(
                "email delivery disabled: Alertmanager runs with receivers that drop notifications",
            );
        }
        report.ensure(
            host,
            &WriteConfig::new(ALERTMANAGER_YML, alertmanager_yml(a)?).mode(0o640),
        )?;
        chown(host, "alertmanager", &[ALERTMANAGER_DIR, ALERTMANAGER_DATA])?;

        io::ensure_dir(&host.path("/etc/prometheus/rules"))?;
        report.ensure(host, &WriteConfig::new(ALERT_RULES, alert_rules_yml()?))?;
        report.ensure(
            host,
            &Step::new("wire Prometheus to Alertmanager", |h| {
                rewrite_prometheus_config(h, config)
            }),
        )?;
        chown(host, "prometheus", &["/etc/prometheus"])?;
        report.ensure(
            host,
            &Step::new("restart prometheus", |h| {
                services::restart_and_verify_service(h, "prometheus")
            }),
        )?;

        report.ensure(
            host,
            &WriteConfig::new("/etc/systemd/system/alertmanager.service", alertmanager_unit(a)),
        )?;
        report.ensure(host, &Step::new("reload systemd units", services::daemon_reload))?;
        report.ensure(host, &EnableService { name: "alertmanager" })?;

        let rules = firewall_rules(config);
        report.ensure(host, &AllowRules { rules: &rules })?;

        info!(
            recipient = %a.email_to,
            relay = %format!("{}:{}", a.smtp_host, a.smtp_port),
            "alerting done"
        );
        Ok(())
    }
}

/// Write the alerting-enabled prometheus.yml and have promtool check it.
/// A rejected config is rolled back to the backup.
fn rewrite_prometheus_config(host: &Host, config: &Config) -> Result<()> {
    let path = host.path(PROMETHEUS_YML);
    let backup = io::write_config_file(&path, &prometheus_yml(config, true)?, None)?;
    let check = host.probe(CommandSpec::new("promtool").args([
        "check".to_string(),
        "config".to_string(),
        host.arg_path(PROMETHEUS_YML),
    ]))?;
    if !check.ok() {
        if let Some(backup) = backup {
            std::fs::copy(&backup, &path)?;
            warn!(backup = %backup.display(), "promtool rejected prometheus.yml, restored backup");
        }
        return Err(ProvisionError::CommandFailed {
            command: format!("promtool check config {PROMETHEUS_YML}"),
            status: check.status_label(),
            stderr: if check.stderr.is_empty() { check.stdout } else { check.stderr },
        });
    }
    Ok(())
}

fn alertmanager_unit(a: &AlertingConfig) -> String {
    let exec = format!(
        "{ALERTMANAGER_BIN} --config.file={ALERTMANAGER_YML} --storage.path={ALERTMANAGER_DATA} \
         --web.listen-address=:{} --cluster.listen-address=:{}",
        a.alertmanager_port, a.cluster_port
    );
    systemd_unit("Prometheus Alertmanager", "alertmanager", &exec)
}

pub fn firewall_rules(config: &Config) -> Vec<FirewallRule> {
    let net = config.vpn.subnet;
    vec![
        FirewallRule::vpn_only(net, config.alerting.alertmanager_port, "Alertmanager"),
        FirewallRule::vpn_only(net, config.alerting.cluster_port, "Alertmanager-cluster"),
    ]
}

// ---------------------------------------------------------------------------
// alertmanager.yml
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct AlertmanagerYml {
    #[serde(skip_serializing_if = "Option::is_none")]
    global: Option<SmtpGlobal>,
    route: Route,
    receivers: Vec<Receiver>,
}

#[derive(Debug, Serialize)]
struct SmtpGlobal {
    smtp_smarthost: String,
    smtp_from: String,
    smtp_auth_username: String,
    smtp_auth_password: String,
    smtp_require_tls: bool,
}

#[derive(Debug, Serialize)]
struct Route {
    receiver: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    group_by: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_wait: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_interval: Option<String>,
    repeat_interval: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    matchers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    routes: Vec<Route>,
}

#[derive(Debug, Serialize)]
struct Receiver {
    name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    email_configs: Vec<EmailConfig>,
}

#[derive(Debug, Serialize)]
struct EmailConfig {
    to: String,
    send_resolved: bool,
}

/// Alertmanager refuses an email receiver without both a recipient and a
/// sender, so delivery needs both addresses.
pub fn delivers_email(a: &AlertingConfig) -> bool {
    !a.email_to.is_empty() && !a.email_from.is_empty()
}

/// Without both addresses the receivers have no `email_configs` and the
/// SMTP globals are left out, which keeps the config loadable.
pub fn alertmanager_yml(a: &AlertingConfig) -> Result<String> {
    let email = delivers_email(a);
    let receiver = |name: &str| Receiver {
        name: name.to_string(),
        email_configs: if email {
            vec![EmailConfig {
                to: a.email_to.clone(),
                send_resolved: true,
            }]
        } else {
            Vec::new()
        },
    };
    let doc = AlertmanagerYml {
        global: email.then(|| SmtpGlobal {
            smtp_smarthost: format!("{}:{}", a.smtp_host, a.smtp_port),
            smtp_from: a.email_from.clone(),
            smtp_auth_username: a.smtp_user.clone(),
            smtp_auth_password: a.smtp_password.clone(),
            smtp_require_tls: true,
        }),
        route: Route {
            receiver: "email".to_string(),
            group_by: vec!["alertname".to_string(), "severity".to_string()],
            group_wait: Some("30s".to_string()),
            group_interval: Some("5m".to_string()),
            repeat_interval: "4h".to_string(),
            matchers: Vec::new(),
            routes: vec![Route {
                receiver: "critical".to_string(),
                group_by: Vec::new(),
                group_wait: None,
                group_interval: None,
                repeat_interval: "1h".to_string(),
                matchers: vec![r#"severity="critical""#.to_string()],
                routes: Vec::new(),
            }],
        },
        receivers: vec![receiver("email"), receiver("critical")],
    };
    Ok(serde_yaml::to_string(&doc)?)
}

// ---------------------------------------------------------------------------
// Alert rules
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RuleFile {
    groups: Vec<RuleGroup>,
}

#[derive(Debug, Serialize)]
struct RuleGroup {
    name: String,
    rules: Vec<AlertRule>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertRule {
    pub alert: String,
    pub expr: String,
    #[serde(rename = "for")]
    pub for_: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

fn rule(name: &str, expr: &str, for_: &str, severity: &str, summary: &str) -> AlertRule {
    AlertRule {
        alert: name.to_string(),
        expr: expr.to_string(),
        for_: for_.to_string(),
        labels: BTreeMap::from([("severity".to_string(), severity.to_string())]),
        annotations: BTreeMap::from([
            ("summary".to_string(), summary.to_string()),
            (
                "description".to_string(),
                "{{ $labels.instance }}: value {{ $value | humanize }}".to_string(),
            ),
        ]),
    }
}

const DISK_USED: &str = concat!(
    r#"(1 - node_filesystem_avail_bytes{fstype!~"tmpfs|overlay|squashfs"}"#,
    r#" / node_filesystem_size_bytes{fstype!~"tmpfs|overlay|squashfs"}) * 100"#,
);
const CPU_USED: &str =
    r#"100 - (avg by (instance) (rate(node_cpu_seconds_total{mode="idle"}[5m])) * 100)"#;
const MEM_USED: &str = "(1 - node_memory_MemAvailable_bytes / node_memory_MemTotal_bytes) * 100";

pub fn alert_rules() -> Vec<AlertRule> {
    vec![
        rule(
            "DiskSpaceWarning",
            &format!("{DISK_USED} > 80"),
            "5m",
            "warning",
            "Disk usage above 80%",
        ),
        rule(
            "DiskSpaceCritical",
            &format!("{DISK_USED} > 90"),
            "2m",
            "critical",
            "Disk usage above 90%",
        ),
        rule(
            "HighCpuWarning",
            &format!("{CPU_USED} > 80"),
            "10m",
            "warning",
            "CPU usage above 80%",
        ),
        rule(
            "HighCpuCritical",
            &format!("{CPU_USED} > 95"),
            "5m",
            "critical",
            "CPU usage above 95%",
        ),
        rule(
            "HighMemoryWarning",
            &format!("{MEM_USED} > 85"),
            "10m",
            "warning",
            "Memory usage above 85%",
        ),
        rule(
            "HighMemoryCritical",
            &format!("{MEM_USED} > 95"),
            "5m",
            "critical",
            "Memory usage above 95%",
        ),
        rule(
            "ServiceDown",
            r#"node_systemd_unit_state{state="active"} == 0"#,
            "2m",
            "critical",
            "A provisioned systemd service is not active",
        ),
        rule("TargetUnreachable", "up == 0", "5m", "warning", "A scrape target is unreachable"),
    ]
}

pub fn alert_rules_yml() -> Result<String> {
    let doc = RuleFile {
        groups: vec![RuleGroup {
            name: "hostforge".to_string(),
            rules: alert_rules(),
        }],
    };
    Ok(serde_yaml::to_string(&doc)?)
}
