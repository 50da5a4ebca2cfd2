//! Stage 1: base OS hardening.
//!
//! Locks SSH down to key-only, non-root logins on a custom port, creates the
//! admin account, enables a default-deny firewall with fail2ban in front of
//! sshd, and turns on unattended security upgrades.

use tracing::{info, warn};

use crate::action::{AllowRules, EnableService, InstallPackages, StageReport, Step, WriteConfig};
use crate::config::Config;
use crate::error::{ProvisionError, Result};
use crate::exec::CommandSpec;
use crate::firewall::{self, FirewallRule, Proto};
use crate::host::Host;
use crate::io;
use crate::packages;
use crate::services;
use crate::stage::{Stage, StageContext, StageId};

pub const SSHD_CONFIG: &str = "/etc/ssh/sshd_config";
pub const SSHD_DROPIN_DIR: &str = "/etc/ssh/sshd_config.d";
pub const SSHD_DROPIN: &str = "/etc/ssh/sshd_config.d/00-hostforge.conf";
pub const JAIL_LOCAL: &str = "/etc/fail2ban/jail.local";
pub const AUTO_UPGRADES: &str = "/etc/apt/apt.conf.d/20auto-upgrades";
const ROOT_AUTHORIZED_KEYS: &str = "/root/.ssh/authorized_keys";
const SSH_SOCKET: &str = "ssh.socket";

pub const CORE_TOOLS: &[&str] = &[
    "curl",
    "wget",
    "git",
    "ufw",
    "ca-certificates",
    "gnupg",
    "lsb-release",
    "htop",
    "jq",
    "iptables-persistent",
];

/// Remote-shell services that have no place on a hardened host.
pub const LEGACY_SERVICES: &[&str] = &["telnet.socket", "rsh.socket"];

const IPTABLES_PERSISTENT_SELECTIONS: &[&str] = &[
    "iptables-persistent iptables-persistent/autosave_v4 boolean true",
    "iptables-persistent iptables-persistent/autosave_v6 boolean true",
];

pub struct Hardening;

impl Stage for Hardening {
    fn id(&self) -> StageId {
        StageId::Hardening
    }

    fn run(&self, ctx: &StageContext, report: &mut StageReport) -> Result<()> {
        let host = ctx.host;
        let config = ctx.config;

        report.ensure(
            host,
            &Step::new("refresh package index and upgrade", |h| {
                packages::update_index(h)?;
                packages::upgrade(h)
            }),
        )?;

        report.ensure(
            host,
            &Step::new("preseed iptables-persistent", |h| {
                for selection in IPTABLES_PERSISTENT_SELECTIONS {
                    packages::preseed(h, selection)?;
                }
                Ok(())
            })
            .unless(|h| packages::is_installed(h, "iptables-persistent")),
        )?;
        report.ensure(host, &InstallPackages { names: CORE_TOOLS })?;

        report.ensure(
            host,
            &Step::new("harden sshd configuration", |h| harden_sshd(h, config)),
        )?;
        report.ensure(
            host,
            &Step::new("restart ssh", restart_sshd),
        )?;

        ensure_admin_account(host, config, report)?;

        report.ensure(
            host,
            &Step::new("firewall default policies", firewall::set_default_policies),
        )?;
        let ssh_rule = [FirewallRule::public(config.ssh_port, Proto::Tcp, "SSH")];
        report.ensure(host, &AllowRules { rules: &ssh_rule })?;
        report.ensure(
            host,
            &Step::new("enable firewall", |h| firewall::enable(h).map(|_| ()))
                .unless(firewall::is_active),
        )?;

        report.ensure(
            host,
            &InstallPackages {
                names: &["fail2ban", "python3-systemd"],
            },
        )?;
        report.ensure(host, &WriteConfig::new(JAIL_LOCAL, jail_local(config.ssh_port)))?;
        report.ensure(host, &EnableService { name: "fail2ban" })?;

        for name in LEGACY_SERVICES {
            report.ensure(
                host,
                &Step::new(format!("disable {name}"), move |h| {
                    services::disable_if_enabled(h, name).map(|_| ())
                })
                .unless(move |h| Ok(!services::is_enabled(h, name)?)),
            )?;
        }

        report.ensure(
            host,
            &InstallPackages {
                names: &["unattended-upgrades"],
            },
        )?;
        report.ensure(host, &WriteConfig::new(AUTO_UPGRADES, AUTO_UPGRADES_CONTENT))?;

        report.ensure(host, &Step::new("remove unused packages", packages::autoremove))?;

        info!(ssh_port = config.ssh_port, admin = %config.admin_user, "hardening done");
        Ok(())
    }
}

/// Apply the three lockdown directives to sshd_config text.
pub fn sshd_settings(content: &str, ssh_port: u16) -> String {
    let port = ssh_port.to_string();
    let mut text = content.to_string();
    for (key, value) in [
        ("PermitRootLogin", "no"),
        ("PasswordAuthentication", "no"),
        ("Port", port.as_str()),
    ] {
        text = io::set_directive(&text, key, value);
    }
    text
}

fn harden_sshd(host: &Host, config: &Config) -> Result<()> {
    let path = host.path(SSHD_CONFIG);
    let current = std::fs::read_to_string(&path)?;
    let backup = io::write_config_file(&path, &sshd_settings(&current, config.ssh_port), None)?;

    // Drop-ins are included before the main body and the first value wins, so
    // a cloud-init drop-in would otherwise re-enable password logins.
    let dropin = host.path(SSHD_DROPIN);
    let dropin_backup = if host.exists(SSHD_DROPIN_DIR) {
        Some(io::write_config_file(
            &dropin,
            &sshd_settings("", config.ssh_port),
            Some(0o644),
        )?)
    } else {
        None
    };

    let check = host.probe(CommandSpec::new("sshd").args([
        "-t".to_string(),
        "-f".to_string(),
        host.arg_path(SSHD_CONFIG),
    ]))?;
    if !check.ok() {
        if let Some(backup) = backup {
            std::fs::copy(&backup, &path)?;
            warn!(
                backup = %backup.display(),
                "sshd rejected the new configuration, restored backup"
            );
        }
        match dropin_backup {
            Some(Some(previous)) => {
                std::fs::copy(&previous, &dropin)?;
            }
            Some(None) => std::fs::remove_file(&dropin)?,
            None => {}
        }
        return Err(ProvisionError::CommandFailed {
            command: format!("sshd -t -f {SSHD_CONFIG}"),
            status: check.status_label(),
            stderr: check.stderr,
        });
    }
    Ok(())
}

/// Restart sshd on its new port. Where sshd is socket-activated (Ubuntu
/// 24.04) the socket's listen port is regenerated from sshd_config only on
/// daemon-reload, and the socket itself must be restarted.
fn restart_sshd(host: &Host) -> Result<()> {
    if services::is_enabled(host, SSH_SOCKET)? || services::is_active(host, SSH_SOCKET)? {
        services::daemon_reload(host)?;
        services::restart_and_verify_service(host, SSH_SOCKET)?;
    }
    services::restart_and_verify_service(host, "ssh")
}

fn home_of(user: &str) -> String {
    format!("/home/{user}")
}

fn ensure_admin_account(host: &Host, config: &Config, report: &mut StageReport) -> Result<()> {
    let user = config.admin_user.as_str();

    report.ensure(
        host,
        &Step::new(format!("create admin user {user}"), |h| {
            h.run(CommandSpec::new("adduser").args([
                "--disabled-password",
                "--gecos",
                "",
                user,
            ]))
            .map(|_| ())
        })
        .unless(|h| h.user_exists(user)),
    )?;

    report.ensure(
        host,
        &Step::new(format!("add {user} to sudo"), |h| {
            h.run(CommandSpec::new("usermod").args(["-aG", "sudo", user]))
                .map(|_| ())
        })
        .unless(|h| h.user_in_group(user, "sudo")),
    )?;

    let keys = format!("{}/.ssh/authorized_keys", home_of(user));
    if !host.exists(ROOT_AUTHORIZED_KEYS) && !host.exists(&keys) {
        report.warn(format!(
            "no authorized_keys for root or {user}: \
             add a key before logging out, password logins are disabled"
        ));
        return Ok(());
    }
    report.ensure(
        host,
        &Step::new(format!("install authorized_keys for {user}"), |h| {
            let ssh_dir = format!("{}/.ssh", home_of(user));
            io::ensure_dir(&h.path(&ssh_dir))?;
            io::set_mode(&h.path(&ssh_dir), 0o700)?;
            std::fs::copy(h.path(ROOT_AUTHORIZED_KEYS), h.path(&keys))?;
            io::set_mode(&h.path(&keys), 0o600)?;
            h.run(CommandSpec::new("chown").args([
                "-R".to_string(),
                format!("{user}:{user}"),
                h.arg_path(&ssh_dir),
            ]))
            .map(|_| ())
        })
        .unless(|h| Ok(h.exists(&keys))),
    )?;
    Ok(())
}

pub fn jail_local(ssh_port: u16) -> String {
    format!(
        "[DEFAULT]\n\
         bantime = 1h\n\
         findtime = 10m\n\
         maxretry = 5\n\
         backend = systemd\n\
         \n\
         [sshd]\n\
         enabled = true\n\
         port = {ssh_port}\n"
    )
}

const AUTO_UPGRADES_CONTENT: &str = "APT::Periodic::Update-Package-Lists \"1\";\n\
APT::Periodic::Unattended-Upgrade \"1\";\n\
APT::Periodic::AutocleanInterval \"7\";\n";
