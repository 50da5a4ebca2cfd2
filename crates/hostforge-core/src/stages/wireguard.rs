//! Stage 3: WireGuard VPN server and one client profile.
//!
//! The tunnel is the only way to reach the monitoring surface, so this stage
//! opens exactly one public port: the WireGuard UDP listener.

use serde::Serialize;
use std::net::IpAddr;
use tracing::info;

use crate::action::{AllowRules, EnableService, InstallPackages, StageReport, Step, WriteConfig};
use crate::config::VpnConfig;
use crate::error::{ProvisionError, Result};
use crate::exec::CommandSpec;
use crate::firewall::{FirewallRule, Proto};
use crate::host::Host;
use crate::io;
use crate::stage::{Stage, StageContext, StageId};

pub const WG_DIR: &str = "/etc/wireguard";
pub const KEYS_DIR: &str = "/etc/wireguard/keys";
pub const CLIENTS_DIR: &str = "/etc/wireguard/clients";
pub const WG_CONF: &str = "/etc/wireguard/wg0.conf";
pub const SYSCTL_FORWARDING: &str = "/etc/sysctl.d/99-hostforge-forwarding.conf";
pub const INTERFACE: &str = "wg0";
pub const SERVICE: &str = "wg-quick@wg0";

/// Written into the client profile when the public address is unknown.
pub const ENDPOINT_PLACEHOLDER: &str = "<SERVER_PUBLIC_IP>";

const FORWARDING: &str = "net.ipv4.ip_forward=1\nnet.ipv6.conf.all.forwarding=1\n";

pub fn client_config_path(name: &str) -> String {
    format!("{CLIENTS_DIR}/{name}.conf")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRole {
    Server,
    Client(String),
}

impl KeyRole {
    fn file_stem(&self) -> String {
        match self {
            KeyRole::Server => "server".to_string(),
            KeyRole::Client(name) => format!("client_{name}"),
        }
    }

    pub fn private_key_path(&self) -> String {
        format!("{KEYS_DIR}/{}_private.key", self.file_stem())
    }

    pub fn public_key_path(&self) -> String {
        format!("{KEYS_DIR}/{}_public.key", self.file_stem())
    }
}

/// A WireGuard keypair as persisted under [`KEYS_DIR`].
#[derive(Debug, Clone)]
pub struct Keypair {
    pub private_key: String,
    pub public_key: String,
    pub role: KeyRole,
}

impl Keypair {
    fn load(host: &Host, role: KeyRole) -> Result<Self> {
        let private_key = std::fs::read_to_string(host.path(role.private_key_path()))?
            .trim()
            .to_string();
        let public_key = std::fs::read_to_string(host.path(role.public_key_path()))?
            .trim()
            .to_string();
        Ok(Self {
            private_key,
            public_key,
            role,
        })
    }
}

fn write_key(host: &Host, absolute: &str, key: &str) -> Result<()> {
    let path = host.path(absolute);
    io::atomic_write(&path, format!("{key}\n").as_bytes())?;
    io::set_mode(&path, 0o600)
}

fn generate_keypair(host: &Host, role: &KeyRole) -> Result<()> {
    let private = host.run(CommandSpec::new("wg").arg("genkey"))?;
    let private = private.stdout_trimmed().to_string();
    if private.is_empty() {
        return Err(ProvisionError::UnexpectedOutput {
            command: "wg genkey".to_string(),
            message: "empty private key".to_string(),
        });
    }
    let public = host.run(CommandSpec::new("wg").arg("pubkey").stdin(format!("{private}\n")))?;
    write_key(host, &role.private_key_path(), &private)?;
    write_key(host, &role.public_key_path(), public.stdout_trimmed())?;
    Ok(())
}

/// Generate a keypair for `role` unless its private key already exists, then
/// load it. Existing keys are never rotated.
pub fn ensure_keypair(host: &Host, report: &mut StageReport, role: KeyRole) -> Result<Keypair> {
    let private = role.private_key_path();
    report.ensure(
        host,
        &Step::new(format!("generate {} keypair", role.file_stem()), |h| {
            generate_keypair(h, &role)
        })
        .unless(|h| Ok(h.exists(&private))),
    )?;
    if !host.exists(&role.public_key_path()) {
        let private_key = std::fs::read_to_string(host.path(&private))?;
        let public = host.run(CommandSpec::new("wg").arg("pubkey").stdin(private_key))?;
        write_key(host, &role.public_key_path(), public.stdout_trimmed())?;
    }
    Keypair::load(host, role)
}

pub struct Wireguard;

impl Stage for Wireguard {
    fn id(&self) -> StageId {
        StageId::Wireguard
    }

    fn run(&self, ctx: &StageContext, report: &mut StageReport) -> Result<()> {
        let host = ctx.host;
        let vpn = &ctx.config.vpn;

        report.ensure(
            host,
            &InstallPackages {
                names: &["wireguard", "wireguard-tools", "qrencode"],
            },
        )?;

        for dir in [WG_DIR, KEYS_DIR, CLIENTS_DIR] {
            io::ensure_dir(&host.path(dir))?;
            io::set_mode(&host.path(dir), 0o700)?;
        }
        let server = ensure_keypair(host, report, KeyRole::Server)?;
        let client = ensure_keypair(host, report, KeyRole::Client(vpn.client_name.clone()))?;

        report.ensure(
            host,
            &WriteConfig::new(WG_CONF, server_config(vpn, &server, &client)).mode(0o600),
        )?;

        report.ensure(host, &WriteConfig::new(SYSCTL_FORWARDING, FORWARDING))?;
        report.ensure(
            host,
            &Step::new("apply kernel forwarding settings", |h| {
                h.run(CommandSpec::new("sysctl").arg("--system")).map(|_| ())
            }),
        )?;

        let iface = default_interface(host)?;
        ensure_nat(host, report, vpn, &iface)?;

        let endpoint = match resolve_public_ip(host, vpn) {
            Ok(ip) => ip,
            Err(e) => {
                report.warn(format!(
                    "could not determine the public address ({e}): edit Endpoint in {} by hand",
                    client_config_path(&vpn.client_name)
                ));
                ENDPOINT_PLACEHOLDER.to_string()
            }
        };
        let client_path = client_config_path(&vpn.client_name);
        report.ensure(
            host,
            &WriteConfig::new(&client_path, client_config(vpn, &client, &server, &endpoint))
                .mode(0o600),
        )?;
        report.artifact(&client_path);
        report.output("endpoint", format!("{endpoint}:{}", vpn.port));
        report.output("client_config", client_path.clone());

        let rules = [FirewallRule::public(vpn.port, Proto::Udp, "WireGuard")];
        report.ensure(host, &AllowRules { rules: &rules })?;

        report.ensure(host, &EnableService { name: SERVICE })?;

        info!(
            endpoint = %format!("{endpoint}:{}", vpn.port),
            client = %client_path,
            "wireguard done"
        );
        Ok(())
    }
}

pub fn server_config(vpn: &VpnConfig, server: &Keypair, client: &Keypair) -> String {
    format!(
        "[Interface]\n\
         Address = {}/{}\n\
         ListenPort = {}\n\
         PrivateKey = {}\n\
         SaveConfig = false\n\
         \n\
         [Peer]\n\
         # {}\n\
         PublicKey = {}\n\
         AllowedIPs = {}/32\n",
        vpn.server_ip,
        vpn.subnet.prefix,
        vpn.port,
        server.private_key,
        vpn.client_name,
        client.public_key,
        vpn.client_ip,
    )
}

pub fn client_config(
    vpn: &VpnConfig,
    client: &Keypair,
    server: &Keypair,
    endpoint: &str,
) -> String {
    format!(
        "[Interface]\n\
         PrivateKey = {}\n\
         Address = {}/32\n\
         DNS = {}\n\
         \n\
         [Peer]\n\
         PublicKey = {}\n\
         Endpoint = {endpoint}:{}\n\
         AllowedIPs = 0.0.0.0/0, ::/0\n\
         PersistentKeepalive = 25\n",
        client.private_key, vpn.client_ip, vpn.client_dns, server.public_key, vpn.port,
    )
}

/// Interface carrying the default route, from `ip route show default`.
pub fn default_interface(host: &Host) -> Result<String> {
    let out = host.run(CommandSpec::new("ip").args(["route", "show", "default"]))?;
    parse_default_interface(&out.stdout).ok_or_else(|| ProvisionError::UnexpectedOutput {
        command: "ip route show default".to_string(),
        message: "no default route".to_string(),
    })
}

fn parse_default_interface(routes: &str) -> Option<String> {
    routes.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        words.find(|w| *w == "dev")?;
        words.next().map(str::to_string)
    })
}

fn ensure_nat(host: &Host, report: &mut StageReport, vpn: &VpnConfig, iface: &str) -> Result<()> {
    let subnet = vpn.subnet.to_string();
    let rule = ["POSTROUTING", "-s", subnet.as_str(), "-o", iface, "-j", "MASQUERADE"];
    report.ensure(
        host,
        &Step::new(format!("masquerade {subnet} via {iface}"), |h| {
            h.run(CommandSpec::new("iptables").args(["-t", "nat", "-A"]).args(rule))?;
            h.run(CommandSpec::new("netfilter-persistent").arg("save"))
                .map(|_| ())
        })
        .unless(|h| {
            Ok(h.probe(CommandSpec::new("iptables").args(["-t", "nat", "-C"]).args(rule))?
                .ok())
        }),
    )?;

    // ufw drops forwarded packets by default.
    let route = format!("ufw route allow in on {INTERFACE} out {iface}");
    report.ensure(
        host,
        &Step::new(format!("allow forwarding {INTERFACE} -> {iface}"), |h| {
            h.run(CommandSpec::new("ufw").args([
                "route", "allow", "in", "on", INTERFACE, "out", iface,
            ]))
            .map(|_| ())
        })
        .unless(|h| {
            let added = h.run(CommandSpec::new("ufw").args(["show", "added"]))?;
            Ok(added.stdout.lines().any(|l| l.trim().starts_with(&route)))
        }),
    )?;
    Ok(())
}

/// `SERVER_PUBLIC_IP` when set, otherwise whatever the IP-echo service says.
pub fn resolve_public_ip(host: &Host, vpn: &VpnConfig) -> Result<String> {
    if let Some(ip) = &vpn.public_ip {
        return Ok(ip.clone());
    }
    let body = host.fetcher().get_text(&vpn.public_ip_url)?;
    let ip = body.trim();
    ip.parse::<IpAddr>()
        .map_err(|_| ProvisionError::UnexpectedOutput {
            command: format!("GET {}", vpn.public_ip_url),
            message: format!("'{ip}' is not an IP address"),
        })?;
    Ok(ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::stages::fixture::{backups, Fixture};
    use std::os::unix::fs::PermissionsExt;

    const ROUTES: &str =
        "default via 203.0.113.1 dev ens3 proto dhcp src 203.0.113.10 metric 100\n";

    fn script(fx: &Fixture) {
        fx.runner.respond_once("wg genkey", CommandOutput::success("c2VydmVyLXByaXZhdGU=\n"));
        fx.runner.respond_once("wg genkey", CommandOutput::success("Y2xpZW50LXByaXZhdGU=\n"));
        fx.runner.respond("wg pubkey", CommandOutput::success("cHVibGljLWtleQ==\n"));
        fx.runner.respond("ip route show default", CommandOutput::success(ROUTES));
        fx.runner.fail("iptables -t nat -C", "Bad rule");
        fx.runner.respond("ufw show added", CommandOutput::success("Added user rules\n"));
    }

    #[test]
    fn parses_default_interface() {
        assert_eq!(parse_default_interface(ROUTES).as_deref(), Some("ens3"));
        assert_eq!(parse_default_interface(""), None);
    }

    #[test]
    fn provisions_server_and_client() {
        let fx = Fixture::new();
        script(&fx);
        let report = fx.run(StageId::Wireguard).unwrap();

        let wg0 = fx.read(WG_CONF);
        assert!(wg0.contains("Address = 10.8.0.1/24"));
        assert!(wg0.contains("ListenPort = 51820"));
        assert!(wg0.contains("PrivateKey = c2VydmVyLXByaXZhdGU="));
        assert!(wg0.contains("AllowedIPs = 10.8.0.2/32"));

        let client = fx.read("/etc/wireguard/clients/client1.conf");
        assert!(client.contains("PrivateKey = Y2xpZW50LXByaXZhdGU="));
        assert!(client.contains("Endpoint = 203.0.113.10:51820"));
        assert!(client.contains("AllowedIPs = 0.0.0.0/0, ::/0"));
        assert!(client.contains("PersistentKeepalive = 25"));

        let mode = std::fs::metadata(fx.path(&KeyRole::Server.private_key_path()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        assert!(fx.read(SYSCTL_FORWARDING).contains("net.ipv4.ip_forward=1"));
        assert!(fx
            .runner
            .ran("iptables -t nat -A POSTROUTING -s 10.8.0.0/24 -o ens3 -j MASQUERADE"));
        assert!(fx.runner.ran("netfilter-persistent save"));
        assert!(fx.runner.ran("ufw route allow in on wg0 out ens3"));
        assert_eq!(report.artifacts.len(), 1);
    }

    #[test]
    fn opens_exactly_one_public_port() {
        let fx = Fixture::new();
        script(&fx);
        fx.run(StageId::Wireguard).unwrap();
        let allows: Vec<String> = fx
            .runner
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("ufw allow"))
            .collect();
        assert_eq!(allows, vec!["ufw allow 51820/udp comment WireGuard"]);
    }

    #[test]
    fn rerun_keeps_keys_and_nat() {
        let fx = Fixture::new();
        script(&fx);
        fx.run(StageId::Wireguard).unwrap();
        let server_key = fx.read(&KeyRole::Server.private_key_path());

        fx.runner.respond("iptables -t nat -C", CommandOutput::success(""));
        fx.runner.respond(
            "ufw show added",
            CommandOutput::success(
                "ufw allow 51820/udp comment 'WireGuard'\nufw route allow in on wg0 out ens3\n",
            ),
        );
        fx.runner.clear_calls();
        fx.run(StageId::Wireguard).unwrap();

        assert_eq!(fx.read(&KeyRole::Server.private_key_path()), server_key);
        assert!(!fx.runner.ran("wg genkey"));
        assert!(!fx.runner.ran("iptables -t nat -A"));
        assert!(!fx.runner.ran("ufw allow"));
        assert!(!fx.runner.ran("ufw route"));
        assert_eq!(backups(&fx, WG_CONF), 1);
    }

    #[test]
    fn unknown_public_ip_writes_placeholder() {
        let fx = Fixture::with_config(&[("SERVER_PUBLIC_IP", "")]);
        script(&fx);
        let report = fx.run(StageId::Wireguard).unwrap();
        assert!(fx.fetcher.requested("api.ipify.org"));
        assert!(report.warnings.iter().any(|w| w.contains("public address")));
        assert!(fx
            .read("/etc/wireguard/clients/client1.conf")
            .contains("Endpoint = <SERVER_PUBLIC_IP>:51820"));
    }

    #[test]
    fn public_ip_from_echo_service() {
        let fx = Fixture::with_config(&[("SERVER_PUBLIC_IP", "")]);
        fx.fetcher.serve("https://api.ipify.org", "198.51.100.7\n");
        let host = fx.host();
        assert_eq!(resolve_public_ip(&host, &fx.config.vpn).unwrap(), "198.51.100.7");
    }

    #[test]
    fn missing_default_route_fails() {
        let fx = Fixture::new();
        script(&fx);
        fx.runner.respond("ip route show default", CommandOutput::success(""));
        assert!(matches!(
            fx.run(StageId::Wireguard),
            Err(ProvisionError::UnexpectedOutput { .. })
        ));
    }
}
