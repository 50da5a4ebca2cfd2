//! Stage 2: Docker engine from the upstream apt repository.

use serde_json::json;
use tracing::info;

use crate::action::{EnableService, InstallPackages, StageReport, Step, WriteConfig};
use crate::config::DockerConfig;
use crate::error::Result;
use crate::exec::CommandSpec;
use crate::host::{Host, OsRelease};
use crate::io;
use crate::packages;
use crate::stage::{Stage, StageContext, StageId};

pub const KEYRINGS_DIR: &str = "/etc/apt/keyrings";
pub const DOCKER_KEY: &str = "/etc/apt/keyrings/docker.asc";
pub const DOCKER_LIST: &str = "/etc/apt/sources.list.d/docker.list";
pub const DAEMON_JSON: &str = "/etc/docker/daemon.json";

pub const DOCKER_PACKAGES: &[&str] = &[
    "docker-ce",
    "docker-ce-cli",
    "containerd.io",
    "docker-buildx-plugin",
    "docker-compose-plugin",
];

pub struct Docker;

impl Stage for Docker {
    fn id(&self) -> StageId {
        StageId::Docker
    }

    fn run(&self, ctx: &StageContext, report: &mut StageReport) -> Result<()> {
        let host = ctx.host;
        let config = ctx.config;

        let key_url = format!("{}/gpg", repo_base(ctx.os));
        report.ensure(
            host,
            &Step::new("add Docker signing key", |h| {
                install_signing_key(h, &key_url, DOCKER_KEY)
            })
            .unless(|h| Ok(h.exists(DOCKER_KEY))),
        )?;

        let arch = host.run(CommandSpec::new("dpkg").arg("--print-architecture"))?;
        let list = repo_line(ctx.os, arch.stdout_trimmed());
        report.ensure(host, &WriteConfig::new(DOCKER_LIST, list))?;
        report.ensure(host, &Step::new("refresh package index", packages::update_index))?;
        report.ensure(
            host,
            &InstallPackages {
                names: DOCKER_PACKAGES,
            },
        )?;

        report.ensure(
            host,
            &Step::new("create docker group", |h| {
                h.run(CommandSpec::new("groupadd").arg("docker")).map(|_| ())
            })
            .unless(|h| h.group_exists("docker")),
        )?;

        let user = config.admin_user.as_str();
        if host.user_exists(user)? {
            report.ensure(
                host,
                &Step::new(format!("add {user} to docker group"), |h| {
                    h.run(CommandSpec::new("usermod").args(["-aG", "docker", user]))
                        .map(|_| ())
                })
                .unless(|h| h.user_in_group(user, "docker")),
            )?;
        } else {
            report.warn(format!(
                "user {user} does not exist, not adding it to the docker group \
                 (run the hardening stage first)"
            ));
        }

        report.ensure(host, &WriteConfig::new(DAEMON_JSON, daemon_json(&config.docker)?))?;
        report.ensure(host, &EnableService { name: "docker" })?;

        info!(dns = ?config.docker.dns, "docker done");
        Ok(())
    }
}

fn repo_base(os: &OsRelease) -> String {
    format!("https://download.docker.com/linux/{}", os.id)
}

pub fn repo_line(os: &OsRelease, arch: &str) -> String {
    format!(
        "deb [arch={arch} signed-by={DOCKER_KEY}] {} {} stable\n",
        repo_base(os),
        os.codename
    )
}

/// Download an ASCII-armoured apt signing key into the keyrings directory.
pub(crate) fn install_signing_key(host: &Host, url: &str, dest: &str) -> Result<()> {
    let dir = host.path(KEYRINGS_DIR);
    io::ensure_dir(&dir)?;
    io::set_mode(&dir, 0o755)?;
    let path = host.path(dest);
    host.fetcher().download(url, &path)?;
    io::set_mode(&path, 0o644)?;
    Ok(())
}

pub fn daemon_json(docker: &DockerConfig) -> Result<String> {
    let doc = json!({
        "log-driver": "json-file",
        "log-opts": {
            "max-size": docker.log_max_size,
            "max-file": docker.log_max_file.to_string(),
        },
        "live-restore": true,
        "dns": docker.dns,
        "metrics-addr": format!("0.0.0.0:{}", docker.metrics_port),
    });
    let mut text = serde_json::to_string_pretty(&doc)?;
    text.push('\n');
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::stages::fixture::{backups, Fixture};

    fn serve_key(fx: &Fixture) {
        fx.fetcher.serve(
            "https://download.docker.com/linux/ubuntu/gpg",
            "-----BEGIN PGP PUBLIC KEY BLOCK-----\n",
        );
        fx.runner
            .respond("dpkg --print-architecture", CommandOutput::success("amd64\n"));
    }

    #[test]
    fn daemon_json_carries_rotation_and_dns() {
        let fx = Fixture::with_config(&[
            ("DOCKER_DNS", "9.9.9.9, 1.1.1.1"),
            ("DOCKER_LOG_MAX_FILE", "5"),
        ]);
        let parsed: serde_json::Value =
            serde_json::from_str(&daemon_json(&fx.config.docker).unwrap()).unwrap();
        assert_eq!(parsed["log-driver"], "json-file");
        assert_eq!(parsed["log-opts"]["max-size"], "10m");
        assert_eq!(parsed["log-opts"]["max-file"], "5");
        assert_eq!(parsed["live-restore"], true);
        assert_eq!(parsed["dns"], json!(["9.9.9.9", "1.1.1.1"]));
        assert_eq!(parsed["metrics-addr"], "0.0.0.0:9323");
    }

    #[test]
    fn installs_from_upstream_repository() {
        let fx = Fixture::new();
        serve_key(&fx);
        fx.runner.fail("getent group docker", "");
        fx.run(StageId::Docker).unwrap();

        assert!(fx.read(DOCKER_KEY).starts_with("-----BEGIN PGP"));
        assert_eq!(
            fx.read(DOCKER_LIST),
            "deb [arch=amd64 signed-by=/etc/apt/keyrings/docker.asc] \
             https://download.docker.com/linux/ubuntu jammy stable\n"
        );
        assert!(fx.runner.ran("groupadd docker"));
        assert!(fx.runner.ran("usermod -aG docker admin"));
        assert!(fx
            .runner
            .ran("apt-get install -y -o Dpkg::Options::=--force-confold docker-compose-plugin"));
        assert!(fx.runner.ran("systemctl restart docker"));
        assert!(fx.read(DAEMON_JSON).contains("\"live-restore\": true"));
    }

    #[test]
    fn rerun_keeps_key_and_backs_up_daemon_json() {
        let fx = Fixture::new();
        serve_key(&fx);
        fx.run(StageId::Docker).unwrap();
        fx.run(StageId::Docker).unwrap();

        assert_eq!(
            fx.fetcher
                .requests()
                .iter()
                .filter(|u| u.ends_with("/gpg"))
                .count(),
            1
        );
        assert_eq!(backups(&fx, DAEMON_JSON), 1);
    }

    #[test]
    fn missing_admin_user_is_a_warning() {
        let fx = Fixture::new();
        serve_key(&fx);
        fx.runner.fail("id -u admin", "no such user");
        let report = fx.run(StageId::Docker).unwrap();
        assert!(report.warnings.iter().any(|w| w.contains("admin")));
        assert!(!fx.runner.ran("usermod"));
    }

    #[test]
    fn inactive_daemon_is_fatal() {
        let fx = Fixture::new();
        serve_key(&fx);
        fx.runner
            .respond("systemctl is-active --quiet docker", CommandOutput::failure(3, ""));
        assert!(matches!(
            fx.run(StageId::Docker),
            Err(crate::error::ProvisionError::ServiceNotActive(s)) if s == "docker"
        ));
    }
}
