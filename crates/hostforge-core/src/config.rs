use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_CONFIG_FILE: &str = "hostforge.conf";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// Ipv4Net
// ---------------------------------------------------------------------------

/// An IPv4 network in CIDR notation, e.g. `10.8.0.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Net {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Net {
    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & self.mask())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.network())
    }
}

impl FromStr for Ipv4Net {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("'{s}' is not in CIDR form (a.b.c.d/n)"))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| format!("'{addr}' is not an IPv4 address"))?;
        let prefix: u8 = prefix
            .parse()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| format!("'{prefix}' is not a prefix length 0-32"))?;
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

impl Serialize for Ipv4Net {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct VpnConfig {
    pub port: u16,
    pub subnet: Ipv4Net,
    pub server_ip: Ipv4Addr,
    pub client_name: String,
    pub client_ip: Ipv4Addr,
    pub client_dns: String,
    /// Fixed endpoint address; resolved through `public_ip_url` when unset.
    pub public_ip: Option<String>,
    pub public_ip_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DockerConfig {
    pub dns: Vec<String>,
    pub log_max_size: String,
    pub log_max_file: u32,
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringConfig {
    pub node_exporter_port: u16,
    pub cadvisor_port: u16,
    pub prometheus_port: u16,
    pub retention: String,
    pub scrape_interval: String,
    pub security_exporter_port: u16,
    pub grafana_port: u16,
    pub grafana_admin_user: String,
    pub grafana_admin_password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertingConfig {
    pub alertmanager_port: u16,
    pub cluster_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,
    pub email_from: String,
    pub email_to: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseSources {
    pub api_url: String,
    pub download_url: String,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

/// Effective settings for one run. Built once from defaults, the config file
/// and the process environment, then passed by reference to every stage.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub ssh_port: u16,
    pub admin_user: String,
    pub vpn: VpnConfig,
    pub docker: DockerConfig,
    pub monitoring: MonitoringConfig,
    pub alerting: AlertingConfig,
    pub releases: ReleaseSources,
    pub log_file: PathBuf,
}

/// Every recognised key with its documented default.
pub const KEYS: &[(&str, &str)] = &[
    ("SSH_PORT", "2222"),
    ("ADMIN_USER", "admin"),
    ("VPN_PORT", "51820"),
    ("VPN_SUBNET", "10.8.0.0/24"),
    ("VPN_SERVER_IP", "10.8.0.1"),
    ("VPN_CLIENT_NAME", "client1"),
    ("VPN_CLIENT_IP", "10.8.0.2"),
    ("VPN_CLIENT_DNS", "1.1.1.1"),
    ("SERVER_PUBLIC_IP", ""),
    ("PUBLIC_IP_URL", "https://api.ipify.org"),
    ("DOCKER_DNS", "1.1.1.1,8.8.8.8"),
    ("DOCKER_LOG_MAX_SIZE", "10m"),
    ("DOCKER_LOG_MAX_FILE", "3"),
    ("DOCKER_METRICS_PORT", "9323"),
    ("NODE_EXPORTER_PORT", "9100"),
    ("CADVISOR_PORT", "8080"),
    ("PROMETHEUS_PORT", "9090"),
    ("PROMETHEUS_RETENTION", "15d"),
    ("SCRAPE_INTERVAL", "15s"),
    ("SECURITY_EXPORTER_PORT", "9191"),
    ("GRAFANA_PORT", "3000"),
    ("GRAFANA_ADMIN_USER", "admin"),
    ("GRAFANA_ADMIN_PASSWORD", ""),
    ("ALERTMANAGER_PORT", "9093"),
    ("ALERTMANAGER_CLUSTER_PORT", "9094"),
    ("SMTP_HOST", "smtp.gmail.com"),
    ("SMTP_PORT", "587"),
    ("SMTP_USER", ""),
    ("SMTP_PASSWORD", ""),
    ("ALERT_EMAIL_FROM", ""),
    ("ALERT_EMAIL_TO", ""),
    ("GITHUB_API_URL", "https://api.github.com"),
    ("GITHUB_DOWNLOAD_URL", "https://github.com"),
    ("LOG_FILE", "/var/log/hostforge.log"),
];

/// Parse `KEY=VALUE` lines. Blank lines and `#` comments are skipped, an
/// `export ` prefix is tolerated and matching surrounding quotes are removed.
pub fn parse_env_file(content: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        values.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    values
}

fn unquote(value: &str) -> &str {
    for q in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(q) && value.ends_with(q) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Layered lookup: environment, then file, then default.
struct Layers<'a> {
    file: &'a HashMap<String, String>,
    env: &'a dyn Fn(&str) -> Option<String>,
}

impl Layers<'_> {
    fn raw(&self, key: &str) -> String {
        if let Some(v) = (self.env)(key) {
            return v;
        }
        if let Some(v) = self.file.get(key) {
            return v.clone();
        }
        default_for(key).to_string()
    }

    fn string(&self, key: &str) -> String {
        self.raw(key).trim().to_string()
    }

    fn parse<T: FromStr>(&self, key: &str, what: &str) -> Result<T> {
        let raw = self.string(key);
        raw.parse().map_err(|_| ProvisionError::InvalidConfig {
            key: key.to_string(),
            message: format!("'{raw}' is not a valid {what}"),
        })
    }
}

fn default_for(key: &str) -> &'static str {
    KEYS.iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
        .unwrap_or("")
}

impl Config {
    /// Load from `path`, overlaying the process environment.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ProvisionError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let file = parse_env_file(&content);
        Self::from_layers(&file, &|key: &str| std::env::var(key).ok())
    }

    /// All defaults, no file, no environment.
    pub fn defaults() -> Result<Self> {
        Self::from_layers(&HashMap::new(), &|_: &str| None)
    }

    pub fn from_layers(
        file: &HashMap<String, String>,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let l = Layers { file, env };

        let subnet: Ipv4Net = l
            .string("VPN_SUBNET")
            .parse()
            .map_err(|message| ProvisionError::InvalidConfig {
                key: "VPN_SUBNET".to_string(),
                message,
            })?;

        let public_ip = Some(l.string("SERVER_PUBLIC_IP")).filter(|s| !s.is_empty());
        let dns = l
            .string("DOCKER_DNS")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            ssh_port: l.parse("SSH_PORT", "port")?,
            admin_user: l.string("ADMIN_USER"),
            vpn: VpnConfig {
                port: l.parse("VPN_PORT", "port")?,
                subnet,
                server_ip: l.parse("VPN_SERVER_IP", "IPv4 address")?,
                client_name: l.string("VPN_CLIENT_NAME"),
                client_ip: l.parse("VPN_CLIENT_IP", "IPv4 address")?,
                client_dns: l.string("VPN_CLIENT_DNS"),
                public_ip,
                public_ip_url: l.string("PUBLIC_IP_URL"),
            },
            docker: DockerConfig {
                dns,
                log_max_size: l.string("DOCKER_LOG_MAX_SIZE"),
                log_max_file: l.parse("DOCKER_LOG_MAX_FILE", "file count")?,
                metrics_port: l.parse("DOCKER_METRICS_PORT", "port")?,
            },
            monitoring: MonitoringConfig {
                node_exporter_port: l.parse("NODE_EXPORTER_PORT", "port")?,
                cadvisor_port: l.parse("CADVISOR_PORT", "port")?,
                prometheus_port: l.parse("PROMETHEUS_PORT", "port")?,
                retention: l.string("PROMETHEUS_RETENTION"),
                scrape_interval: l.string("SCRAPE_INTERVAL"),
                security_exporter_port: l.parse("SECURITY_EXPORTER_PORT", "port")?,
                grafana_port: l.parse("GRAFANA_PORT", "port")?,
                grafana_admin_user: l.string("GRAFANA_ADMIN_USER"),
                grafana_admin_password: l.string("GRAFANA_ADMIN_PASSWORD"),
            },
            alerting: AlertingConfig {
                alertmanager_port: l.parse("ALERTMANAGER_PORT", "port")?,
                cluster_port: l.parse("ALERTMANAGER_CLUSTER_PORT", "port")?,
                smtp_host: l.string("SMTP_HOST"),
                smtp_port: l.parse("SMTP_PORT", "port")?,
                smtp_user: l.string("SMTP_USER"),
                smtp_password: l.string("SMTP_PASSWORD"),
                email_from: l.string("ALERT_EMAIL_FROM"),
                email_to: l.string("ALERT_EMAIL_TO"),
            },
            releases: ReleaseSources {
                api_url: l.string("GITHUB_API_URL").trim_end_matches('/').to_string(),
                download_url: l
                    .string("GITHUB_DOWNLOAD_URL")
                    .trim_end_matches('/')
                    .to_string(),
            },
            log_file: PathBuf::from(l.string("LOG_FILE")),
        })
    }

    /// Copy with secrets replaced, for display.
    pub fn redacted(&self) -> Self {
        let mut c = self.clone();
        for secret in [
            &mut c.monitoring.grafana_admin_password,
            &mut c.alerting.smtp_password,
        ] {
            if !secret.is_empty() {
                *secret = "********".to_string();
            }
        }
        c
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if self.admin_user.is_empty() {
            error("ADMIN_USER must not be empty".to_string());
        }
        if self.admin_user == "root" {
            error("ADMIN_USER must not be root: root login is disabled".to_string());
        }
        if self.monitoring.grafana_admin_password.is_empty() {
            error("GRAFANA_ADMIN_PASSWORD must be set".to_string());
        }
        for (key, ip) in [
            ("VPN_SERVER_IP", self.vpn.server_ip),
            ("VPN_CLIENT_IP", self.vpn.client_ip),
        ] {
            if !self.vpn.subnet.contains(ip) {
                error(format!("{key} {ip} is outside VPN_SUBNET {}", self.vpn.subnet));
            }
        }
        if self.vpn.server_ip == self.vpn.client_ip {
            error("VPN_SERVER_IP and VPN_CLIENT_IP must differ".to_string());
        }
        if self.vpn.client_name.is_empty()
            || !self
                .vpn
                .client_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            error(format!(
                "VPN_CLIENT_NAME '{}' must be non-empty and use only letters, digits, '-' or '_'",
                self.vpn.client_name
            ));
        }

        let ports = self.port_assignments();
        for (i, (key, port)) in ports.iter().enumerate() {
            if *port == 0 {
                error(format!("{key} must not be 0"));
            }
            if let Some((other, _)) = ports[..i].iter().find(|(_, p)| p == port) {
                error(format!("{key} and {other} both use port {port}"));
            }
        }

        if self.ssh_port == 22 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "SSH_PORT is 22: the default port attracts automated scans".to_string(),
            });
        }
        for (key, value) in [
            ("SMTP_USER", &self.alerting.smtp_user),
            ("SMTP_PASSWORD", &self.alerting.smtp_password),
            ("ALERT_EMAIL_FROM", &self.alerting.email_from),
            ("ALERT_EMAIL_TO", &self.alerting.email_to),
        ] {
            if value.is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("{key} is empty: alert emails will not be delivered"),
                });
            }
        }

        warnings
    }

    pub fn has_errors(warnings: &[ConfigWarning]) -> bool {
        warnings.iter().any(|w| w.level == WarnLevel::Error)
    }

    fn port_assignments(&self) -> Vec<(&'static str, u16)> {
        vec![
            ("SSH_PORT", self.ssh_port),
            ("VPN_PORT", self.vpn.port),
            ("DOCKER_METRICS_PORT", self.docker.metrics_port),
            ("NODE_EXPORTER_PORT", self.monitoring.node_exporter_port),
            ("CADVISOR_PORT", self.monitoring.cadvisor_port),
            ("PROMETHEUS_PORT", self.monitoring.prometheus_port),
            ("SECURITY_EXPORTER_PORT", self.monitoring.security_exporter_port),
            ("GRAFANA_PORT", self.monitoring.grafana_port),
            ("ALERTMANAGER_PORT", self.alerting.alertmanager_port),
            ("ALERTMANAGER_CLUSTER_PORT", self.alerting.cluster_port),
        ]
    }
}

/// Commented config file listing every key with its default.
pub fn template(grafana_password: &str) -> String {
    let mut out = String::from(
        "# hostforge configuration\n\
         #\n\
         # KEY=VALUE pairs. Environment variables with the same name override\n\
         # these values; keys left out fall back to the defaults shown here.\n",
    );
    let sections: &[(&str, &[&str])] = &[
        ("SSH and admin account", &["SSH_PORT", "ADMIN_USER"]),
        (
            "WireGuard",
            &[
                "VPN_PORT",
                "VPN_SUBNET",
                "VPN_SERVER_IP",
                "VPN_CLIENT_NAME",
                "VPN_CLIENT_IP",
                "VPN_CLIENT_DNS",
                "SERVER_PUBLIC_IP",
                "PUBLIC_IP_URL",
            ],
        ),
        (
            "Docker",
            &[
                "DOCKER_DNS",
                "DOCKER_LOG_MAX_SIZE",
                "DOCKER_LOG_MAX_FILE",
                "DOCKER_METRICS_PORT",
            ],
        ),
        (
            "Monitoring (reachable over the VPN only)",
            &[
                "NODE_EXPORTER_PORT",
                "CADVISOR_PORT",
                "PROMETHEUS_PORT",
                "PROMETHEUS_RETENTION",
                "SCRAPE_INTERVAL",
                "SECURITY_EXPORTER_PORT",
                "GRAFANA_PORT",
                "GRAFANA_ADMIN_USER",
                "GRAFANA_ADMIN_PASSWORD",
            ],
        ),
        (
            "Alerting",
            &[
                "ALERTMANAGER_PORT",
                "ALERTMANAGER_CLUSTER_PORT",
                "SMTP_HOST",
                "SMTP_PORT",
                "SMTP_USER",
                "SMTP_PASSWORD",
                "ALERT_EMAIL_FROM",
                "ALERT_EMAIL_TO",
            ],
        ),
        (
            "Sources and logging",
            &["GITHUB_API_URL", "GITHUB_DOWNLOAD_URL", "LOG_FILE"],
        ),
    ];
    for (title, keys) in sections {
        out.push_str(&format!("\n# --- {title}\n"));
        for key in *keys {
            let value = if *key == "GRAFANA_ADMIN_PASSWORD" {
                grafana_password
            } else {
                default_for(key)
            };
            out.push_str(&format!("{key}={value}\n"));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn file(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::defaults().unwrap();
        assert_eq!(cfg.ssh_port, 2222);
        assert_eq!(cfg.admin_user, "admin");
        assert_eq!(cfg.vpn.port, 51820);
        assert_eq!(cfg.vpn.subnet.to_string(), "10.8.0.0/24");
        assert_eq!(cfg.monitoring.retention, "15d");
        assert_eq!(cfg.docker.dns, vec!["1.1.1.1", "8.8.8.8"]);
        assert!(cfg.vpn.public_ip.is_none());
    }

    #[test]
    fn file_override_takes_effect() {
        let f = file(&[("SSH_PORT", "2200"), ("VPN_SUBNET", "10.0.0.0/24")]);
        let cfg = Config::from_layers(&f, &no_env).unwrap();
        assert_eq!(cfg.ssh_port, 2200);
        assert_eq!(cfg.vpn.subnet.to_string(), "10.0.0.0/24");
        // untouched keys keep their defaults
        assert_eq!(cfg.monitoring.grafana_port, 3000);
    }

    #[test]
    fn environment_beats_file() {
        let f = file(&[("SSH_PORT", "2200")]);
        let env = |key: &str| (key == "SSH_PORT").then(|| "2345".to_string());
        let cfg = Config::from_layers(&f, &env).unwrap();
        assert_eq!(cfg.ssh_port, 2345);
    }

    #[test]
    fn invalid_port_names_the_key() {
        let f = file(&[("GRAFANA_PORT", "eighty")]);
        let err = Config::from_layers(&f, &no_env).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("GRAFANA_PORT"), "{msg}");
        assert!(msg.contains("eighty"), "{msg}");
    }

    #[test]
    fn invalid_subnet_is_rejected() {
        let f = file(&[("VPN_SUBNET", "10.8.0.0")]);
        assert!(matches!(
            Config::from_layers(&f, &no_env),
            Err(ProvisionError::InvalidConfig { key, .. }) if key == "VPN_SUBNET"
        ));
    }

    #[test]
    fn parse_env_file_handles_comments_quotes_and_export() {
        let content = r#"
# comment
SSH_PORT=2222
export ADMIN_USER="ops"
SMTP_PASSWORD='s3cr3t=with=equals'
not a pair
"#;
        let values = parse_env_file(content);
        assert_eq!(values["SSH_PORT"], "2222");
        assert_eq!(values["ADMIN_USER"], "ops");
        assert_eq!(values["SMTP_PASSWORD"], "s3cr3t=with=equals");
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn load_missing_file_is_config_not_found() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(&dir.path().join("hostforge.conf")).unwrap_err();
        assert!(matches!(err, ProvisionError::ConfigNotFound(_)));
    }

    #[test]
    fn template_round_trips_to_defaults() {
        let values = parse_env_file(&template("pw"));
        for (key, default) in KEYS {
            if *key == "GRAFANA_ADMIN_PASSWORD" {
                assert_eq!(values[*key], "pw");
            } else {
                assert_eq!(values[*key], *default, "{key}");
            }
        }
    }

    #[test]
    fn subnet_membership() {
        let net: Ipv4Net = "10.8.0.0/24".parse().unwrap();
        assert!(net.contains("10.8.0.1".parse().unwrap()));
        assert!(!net.contains("10.9.0.1".parse().unwrap()));
        let host_bits: Ipv4Net = "10.8.0.5/24".parse().unwrap();
        assert_eq!(host_bits.to_string(), "10.8.0.0/24");
    }

    #[test]
    fn validate_requires_grafana_password() {
        let cfg = Config::defaults().unwrap();
        let warnings = cfg.validate();
        assert!(Config::has_errors(&warnings));
        assert!(warnings
            .iter()
            .any(|w| w.message.contains("GRAFANA_ADMIN_PASSWORD")));
    }

    #[test]
    fn validate_complete_config_has_only_smtp_warnings() {
        let f = file(&[("GRAFANA_ADMIN_PASSWORD", "pw")]);
        let cfg = Config::from_layers(&f, &no_env).unwrap();
        let warnings = cfg.validate();
        assert!(!Config::has_errors(&warnings));
        assert!(warnings.iter().all(|w| w.message.contains("SMTP")
            || w.message.contains("ALERT_EMAIL_")));
        assert!(warnings
            .iter()
            .any(|w| w.message == "ALERT_EMAIL_FROM is empty: alert emails will not be delivered"));
    }

    #[test]
    fn validate_flags_ip_outside_subnet_and_port_clash() {
        let f = file(&[
            ("GRAFANA_ADMIN_PASSWORD", "pw"),
            ("VPN_CLIENT_IP", "192.168.1.2"),
            ("GRAFANA_PORT", "9090"),
        ]);
        let cfg = Config::from_layers(&f, &no_env).unwrap();
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.message.contains("VPN_CLIENT_IP 192.168.1.2 is outside")));
        assert!(warnings
            .iter()
            .any(|w| w.message.contains("GRAFANA_PORT and PROMETHEUS_PORT")));
    }

    #[test]
    fn validate_warns_on_default_ssh_port() {
        let f = file(&[("GRAFANA_ADMIN_PASSWORD", "pw"), ("SSH_PORT", "22")]);
        let cfg = Config::from_layers(&f, &no_env).unwrap();
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.level == WarnLevel::Warning && w.message.contains("SSH_PORT is 22")));
    }

    #[test]
    fn redacted_masks_secrets() {
        let f = file(&[("GRAFANA_ADMIN_PASSWORD", "pw"), ("SMTP_PASSWORD", "smtp")]);
        let cfg = Config::from_layers(&f, &no_env).unwrap().redacted();
        assert_eq!(cfg.monitoring.grafana_admin_password, "********");
        assert_eq!(cfg.alerting.smtp_password, "********");
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        assert!(!yaml.contains("smtp\n"));
    }
}
