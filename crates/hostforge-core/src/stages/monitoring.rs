//! Stage 4: metrics collection and dashboards.
//!
//! node_exporter and Prometheus run as systemd units from upstream release
//! tarballs, cAdvisor as a container, Grafana from its apt repository. Every
//! port is reachable from the VPN subnet only.

use serde::Serialize;
use tracing::info;

use crate::action::{AllowRules, EnableService, InstallPackages, StageReport, Step, WriteConfig};
use crate::config::Config;
use crate::error::Result;
use crate::exec::CommandSpec;
use crate::firewall::FirewallRule;
use crate::host::Host;
use crate::io;
use crate::packages;
use crate::release;
use crate::services;
use crate::stage::{Stage, StageContext, StageId};
use crate::stages::docker::install_signing_key;
use crate::stages::DOWNLOAD_DIR;

pub const PROMETHEUS_DIR: &str = "/etc/prometheus";
pub const PROMETHEUS_YML: &str = "/etc/prometheus/prometheus.yml";
pub const PROMETHEUS_DATA: &str = "/var/lib/prometheus";
pub const PROMETHEUS_BIN: &str = "/usr/local/bin/prometheus";
pub const NODE_EXPORTER_BIN: &str = "/usr/local/bin/node_exporter";
pub const GRAFANA_KEY: &str = "/etc/apt/keyrings/grafana.asc";
pub const GRAFANA_LIST: &str = "/etc/apt/sources.list.d/grafana.list";
pub const GRAFANA_INI: &str = "/etc/grafana/grafana.ini";
pub const CADVISOR_CONTAINER: &str = "cadvisor";
pub const CADVISOR_IMAGE: &str = "gcr.io/cadvisor/cadvisor";

/// Rules file the alerting stage installs; its presence means prometheus.yml
/// must keep the alerting sections.
pub const ALERT_RULES: &str = "/etc/prometheus/rules/hostforge-alerts.yml";

/// Units whose state node_exporter reports for the ServiceDown alert.
const WATCHED_UNITS: &str = concat!(
    r"(ssh|docker|fail2ban|wg-quick@wg0|",
    r"node_exporter|prometheus|grafana-server|alertmanager)\.service",
);

pub struct Monitoring;

impl Stage for Monitoring {
    fn id(&self) -> StageId {
        StageId::Monitoring
    }

    fn run(&self, ctx: &StageContext, report: &mut StageReport) -> Result<()> {
        let host = ctx.host;
        let config = ctx.config;
        let m = &config.monitoring;

        // node_exporter
        ensure_system_user(host, report, "node_exporter")?;
        install_release(
            host,
            report,
            config,
            "prometheus/node_exporter",
            "node_exporter",
            &["node_exporter"],
        )?;
        report.ensure(
            host,
            &WriteConfig::new(
                "/etc/systemd/system/node_exporter.service",
                node_exporter_unit(m.node_exporter_port),
            ),
        )?;

        // cAdvisor
        report.ensure(
            host,
            &Step::new("run cAdvisor container", |h| run_cadvisor(h, config))
                .unless(|h| container_exists(h, CADVISOR_CONTAINER)),
        )?;

        // Prometheus
        ensure_system_user(host, report, "prometheus")?;
        install_release(
            host,
            report,
            config,
            "prometheus/prometheus",
            "prometheus",
            &["prometheus", "promtool"],
        )?;
        for dir in [PROMETHEUS_DIR, PROMETHEUS_DATA] {
            io::ensure_dir(&host.path(dir))?;
        }
        let with_alerting = host.exists(ALERT_RULES);
        report.ensure(
            host,
            &WriteConfig::new(PROMETHEUS_YML, prometheus_yml(config, with_alerting)?),
        )?;
        chown(host, "prometheus", &[PROMETHEUS_DIR, PROMETHEUS_DATA])?;
        report.ensure(
            host,
            &WriteConfig::new("/etc/systemd/system/prometheus.service", prometheus_unit(config)),
        )?;

        // Grafana
        report.ensure(
            host,
            &Step::new("add Grafana signing key", |h| {
                install_signing_key(h, "https://apt.grafana.com/gpg.key", GRAFANA_KEY)
            })
            .unless(|h| Ok(h.exists(GRAFANA_KEY))),
        )?;
        report.ensure(
            host,
            &WriteConfig::new(
                GRAFANA_LIST,
                format!("deb [signed-by={GRAFANA_KEY}] https://apt.grafana.com stable main\n"),
            ),
        )?;
        report.ensure(
            host,
            &Step::new("refresh package index", packages::update_index)
                .unless(|h| packages::is_installed(h, "grafana")),
        )?;
        report.ensure(host, &InstallPackages { names: &["grafana"] })?;
        let ini = match std::fs::read_to_string(host.path(GRAFANA_INI)) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        report.ensure(host, &WriteConfig::new(GRAFANA_INI, grafana_ini(&ini, config)))?;

        report.ensure(host, &Step::new("reload systemd units", services::daemon_reload))?;
        for service in ["node_exporter", "prometheus", "grafana-server"] {
            report.ensure(host, &EnableService { name: service })?;
        }

        let rules = firewall_rules(config);
        report.ensure(host, &AllowRules { rules: &rules })?;

        info!(
            prometheus = %format!("http://{}:{}", config.vpn.server_ip, m.prometheus_port),
            grafana = %format!("http://{}:{}", config.vpn.server_ip, m.grafana_port),
            "monitoring done"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared install helpers
// ---------------------------------------------------------------------------

pub(crate) fn ensure_system_user(host: &Host, report: &mut StageReport, name: &str) -> Result<()> {
    report.ensure(
        host,
        &Step::new(format!("create system user {name}"), |h| {
            h.run(CommandSpec::new("useradd").args([
                "--system",
                "--no-create-home",
                "--shell",
                "/usr/sbin/nologin",
                name,
            ]))
            .map(|_| ())
        })
        .unless(|h| h.user_exists(name)),
    )?;
    Ok(())
}

/// Download and install `binaries` from the latest `project` release unless
/// the first binary is already in `/usr/local/bin`.
pub(crate) fn install_release(
    host: &Host,
    report: &mut StageReport,
    config: &Config,
    project: &str,
    binary: &str,
    binaries: &[&str],
) -> Result<()> {
    let marker = format!("/usr/local/bin/{}", binaries.first().copied().unwrap_or(binary));
    report.ensure(
        host,
        &Step::new(format!("install {binary} from {project}"), |h| {
            let archive =
                release::fetch_release_archive(h, &config.releases, project, binary, DOWNLOAD_DIR)?;
            release::install_release_binaries(h, &archive, binary, binaries)
        })
        .unless(|h| Ok(h.exists(&marker))),
    )?;
    Ok(())
}

pub(crate) fn chown(host: &Host, user: &str, paths: &[&str]) -> Result<()> {
    host.run(
        CommandSpec::new("chown")
            .args(["-R".to_string(), format!("{user}:{user}")])
            .args(paths.iter().map(|p| host.arg_path(p))),
    )?;
    Ok(())
}

pub(crate) fn systemd_unit(description: &str, user: &str, exec_start: &str) -> String {
    format!(
        "[Unit]\n\
         Description={description}\n\
         Wants=network-online.target\n\
         After=network-online.target\n\
         \n\
         [Service]\n\
         User={user}\n\
         Group={user}\n\
         Type=simple\n\
         ExecStart={exec_start}\n\
         Restart=on-failure\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

fn node_exporter_unit(port: u16) -> String {
    let exec = format!(
        "{NODE_EXPORTER_BIN} --web.listen-address=:{port} --collector.systemd \
         --collector.systemd.unit-include={WATCHED_UNITS}"
    );
    systemd_unit("Prometheus Node Exporter", "node_exporter", &exec)
}

fn prometheus_unit(config: &Config) -> String {
    let exec = format!(
        "{PROMETHEUS_BIN} --config.file={PROMETHEUS_YML} --storage.tsdb.path={PROMETHEUS_DATA} \
         --storage.tsdb.retention.time={} --web.listen-address=:{}",
        config.monitoring.retention, config.monitoring.prometheus_port
    );
    systemd_unit("Prometheus", "prometheus", &exec)
}

// ---------------------------------------------------------------------------
// cAdvisor
// ---------------------------------------------------------------------------

fn container_exists(host: &Host, name: &str) -> Result<bool> {
    let out = host.run(CommandSpec::new("docker").args(["ps", "-a", "--format", "{{.Names}}"]))?;
    Ok(out.stdout.lines().any(|l| l.trim() == name))
}

/// `docker run` arguments for cAdvisor. The port is published on the VPN
/// address only since Docker's published ports bypass ufw.
pub fn cadvisor_args(config: &Config, tag: &str) -> Vec<String> {
    let publish = format!(
        "{}:{}:8080",
        config.vpn.server_ip, config.monitoring.cadvisor_port
    );
    let mut args: Vec<String> = [
        "run",
        "-d",
        "--name",
        CADVISOR_CONTAINER,
        "--restart",
        "unless-stopped",
        "--privileged",
        "--device=/dev/kmsg",
        "-p",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(publish);
    for mount in [
        "/:/rootfs:ro",
        "/var/run:/var/run:ro",
        "/sys:/sys:ro",
        "/var/lib/docker/:/var/lib/docker:ro",
        "/dev/disk/:/dev/disk:ro",
    ] {
        args.push("-v".to_string());
        args.push(mount.to_string());
    }
    args.push(format!("{CADVISOR_IMAGE}:{tag}"));
    args
}

fn run_cadvisor(host: &Host, config: &Config) -> Result<()> {
    let tag = release::resolve_latest_release(host, &config.releases, "google/cadvisor")?;
    host.run(CommandSpec::new("docker").args(cadvisor_args(config, &tag)))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// prometheus.yml
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct PrometheusYml {
    global: Global,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    rule_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alerting: Option<AlertingSection>,
    scrape_configs: Vec<ScrapeConfig>,
}

#[derive(Debug, Serialize)]
struct Global {
    scrape_interval: String,
    evaluation_interval: String,
}

#[derive(Debug, Serialize)]
struct AlertingSection {
    alertmanagers: Vec<StaticTargets>,
}

#[derive(Debug, Serialize)]
struct StaticTargets {
    static_configs: Vec<StaticConfig>,
}

#[derive(Debug, Serialize)]
struct StaticConfig {
    targets: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ScrapeConfig {
    job_name: String,
    static_configs: Vec<StaticConfig>,
}

fn job(name: &str, target: String) -> ScrapeConfig {
    ScrapeConfig {
        job_name: name.to_string(),
        static_configs: vec![StaticConfig {
            targets: vec![target],
        }],
    }
}

/// Render prometheus.yml: three scrape jobs, plus the rule file and
/// Alertmanager target once alerting is installed.
pub fn prometheus_yml(config: &Config, with_alerting: bool) -> Result<String> {
    let m = &config.monitoring;
    let doc = PrometheusYml {
        global: Global {
            scrape_interval: m.scrape_interval.clone(),
            evaluation_interval: m.scrape_interval.clone(),
        },
        rule_files: if with_alerting {
            vec![ALERT_RULES.to_string()]
        } else {
            Vec::new()
        },
        alerting: with_alerting.then(|| AlertingSection {
            alertmanagers: vec![StaticTargets {
                static_configs: vec![StaticConfig {
                    targets: vec![format!("localhost:{}", config.alerting.alertmanager_port)],
                }],
            }],
        }),
        scrape_configs: vec![
            job("node", format!("localhost:{}", m.node_exporter_port)),
            job("cadvisor", format!("{}:{}", config.vpn.server_ip, m.cadvisor_port)),
            job("security", format!("localhost:{}", m.security_exporter_port)),
        ],
    };
    Ok(serde_yaml::to_string(&doc)?)
}

fn grafana_ini(current: &str, config: &Config) -> String {
    let m = &config.monitoring;
    let port = m.grafana_port.to_string();
    let mut ini = current.to_string();
    for (section, key, value) in [
        ("server", "http_port", port.as_str()),
        ("security", "admin_user", m.grafana_admin_user.as_str()),
        ("security", "admin_password", m.grafana_admin_password.as_str()),
        ("auth.anonymous", "enabled", "false"),
    ] {
        ini = io::set_ini_value(&ini, section, key, value);
    }
    ini
}

/// The six metric and dashboard ports, opened to the VPN subnet only.
pub fn firewall_rules(config: &Config) -> Vec<FirewallRule> {
    let net = config.vpn.subnet;
    let m = &config.monitoring;
    vec![
        FirewallRule::vpn_only(net, m.prometheus_port, "Prometheus"),
        FirewallRule::vpn_only(net, m.grafana_port, "Grafana"),
        FirewallRule::vpn_only(net, m.node_exporter_port, "node_exporter"),
        FirewallRule::vpn_only(net, m.cadvisor_port, "cAdvisor"),
        FirewallRule::vpn_only(net, m.security_exporter_port, "security-exporter"),
        FirewallRule::vpn_only(net, config.docker.metrics_port, "docker-metrics"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisionError;
    use crate::exec::CommandOutput;
    use crate::stages::fixture::{backups, serve_release, Fixture};

    fn script(fx: &Fixture) {
        fx.runner.respond("uname -m", CommandOutput::success("x86_64\n"));
        fx.runner.fail("id -u node_exporter", "no such user");
        fx.runner.fail("id -u prometheus", "no such user");
        fx.runner.respond("docker ps -a", CommandOutput::success("web\n"));
        fx.runner.respond("ufw show added", CommandOutput::success("Added user rules\n"));
        serve_release(fx, "prometheus/node_exporter", "node_exporter", "v1.8.2");
        serve_release(fx, "prometheus/prometheus", "prometheus", "v2.53.0");
        fx.fetcher.serve(
            "https://api.github.com/repos/google/cadvisor/releases/latest",
            r#"{"tag_name":"v0.49.1"}"#,
        );
        fx.fetcher.serve("https://apt.grafana.com/gpg.key", "grafana key\n");
        fx.write(
            GRAFANA_INI,
            "[server]\n;http_port = 3000\n\n\
             [security]\n;admin_user = admin\n;admin_password = admin\n\n\
             [auth.anonymous]\n;enabled = false\n",
        );
    }

    #[test]
    fn prometheus_yml_has_three_jobs() {
        let fx = Fixture::new();
        let yml = prometheus_yml(&fx.config, false).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yml).unwrap();
        let jobs = doc["scrape_configs"].as_sequence().unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(doc["global"]["scrape_interval"], "15s");
        assert_eq!(jobs[1]["static_configs"][0]["targets"][0], "10.8.0.1:8080");
        assert_eq!(jobs[2]["static_configs"][0]["targets"][0], "localhost:9191");
        assert!(doc.get("alerting").is_none());
        assert!(doc.get("rule_files").is_none());
    }

    #[test]
    fn cadvisor_is_published_on_vpn_address() {
        let fx = Fixture::new();
        let args = cadvisor_args(&fx.config, "v0.49.1");
        let line = args.join(" ");
        assert!(line.contains("-p 10.8.0.1:8080:8080"));
        assert!(line.contains("--restart unless-stopped"));
        assert!(line.contains("-v /:/rootfs:ro"));
        assert!(line.ends_with("gcr.io/cadvisor/cadvisor:v0.49.1"));
    }

    #[test]
    fn installs_full_stack() {
        let fx = Fixture::new();
        script(&fx);
        fx.run(StageId::Monitoring).unwrap();

        assert!(fx
            .runner
            .ran("useradd --system --no-create-home --shell /usr/sbin/nologin node_exporter"));
        assert!(fx.fetcher.requested("node_exporter-1.8.2.linux-amd64.tar.gz"));
        assert!(fx.fetcher.requested("prometheus-2.53.0.linux-amd64.tar.gz"));
        assert!(fx.runner.ran("docker run -d --name cadvisor"));

        let unit = fx.read("/etc/systemd/system/prometheus.service");
        assert!(unit.contains("--storage.tsdb.retention.time=15d"));
        assert!(fx.read(PROMETHEUS_YML).contains("job_name: security"));

        let ini = fx.read(GRAFANA_INI);
        assert!(ini.contains("http_port = 3000"));
        assert!(ini.contains("admin_password = s3cret-grafana"));
        assert!(ini.contains("[auth.anonymous]\nenabled = false"));
        assert_eq!(backups(&fx, GRAFANA_INI), 1);

        let calls = fx.runner.calls();
        let reload = calls.iter().position(|c| c == "systemctl daemon-reload").unwrap();
        let start = calls
            .iter()
            .position(|c| c == "systemctl restart prometheus")
            .unwrap();
        assert!(reload < start);
    }

    #[test]
    fn every_port_is_vpn_scoped() {
        let fx = Fixture::new();
        script(&fx);
        fx.run(StageId::Monitoring).unwrap();
        let allows: Vec<String> = fx
            .runner
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("ufw allow"))
            .collect();
        assert_eq!(allows.len(), 6);
        assert!(allows
            .iter()
            .all(|c| c.starts_with("ufw allow from 10.8.0.0/24 to any port")));
        assert!(firewall_rules(&fx.config).iter().all(|r| !r.is_public()));
    }

    #[test]
    fn present_components_are_skipped() {
        let fx = Fixture::new();
        script(&fx);
        fx.runner.respond("id -u node_exporter", CommandOutput::success("998\n"));
        fx.runner.respond("id -u prometheus", CommandOutput::success("997\n"));
        fx.runner.respond("docker ps -a", CommandOutput::success("cadvisor\n"));
        fx.runner.respond(
            "dpkg-query -W -f=${Status} grafana",
            CommandOutput::success("install ok installed"),
        );
        fx.write(NODE_EXPORTER_BIN, "");
        fx.write(PROMETHEUS_BIN, "");
        fx.write(GRAFANA_KEY, "");

        fx.run(StageId::Monitoring).unwrap();
        assert!(fx.fetcher.requests().is_empty());
        assert!(!fx.runner.ran("useradd"));
        assert!(!fx.runner.ran("docker run"));
        assert!(!fx.runner.ran("apt-get"));
    }

    #[test]
    fn rerun_keeps_alerting_sections() {
        let fx = Fixture::new();
        script(&fx);
        fx.write(ALERT_RULES, "groups: []\n");
        fx.run(StageId::Monitoring).unwrap();
        let yml = fx.read(PROMETHEUS_YML);
        assert!(yml.contains("hostforge-alerts.yml"));
        assert!(yml.contains("localhost:9093"));
    }

    #[test]
    fn unreadable_grafana_ini_stops_stage() {
        let fx = Fixture::new();
        script(&fx);
        std::fs::remove_file(fx.path(GRAFANA_INI)).unwrap();
        std::fs::create_dir(fx.path(GRAFANA_INI)).unwrap();

        let err = fx.run(StageId::Monitoring).unwrap_err();
        assert!(matches!(err, ProvisionError::Io(_)), "{err:?}");
        assert!(!fx.runner.ran("systemctl enable grafana-server"));
    }
}
