//! apt package management.

use tracing::{debug, info};

use crate::error::{ProvisionError, Result};
use crate::exec::CommandSpec;
use crate::host::Host;

fn apt_get(args: &[&str]) -> CommandSpec {
    CommandSpec::new("apt-get")
        .args(args.iter().copied())
        .env("DEBIAN_FRONTEND", "noninteractive")
}

pub fn is_installed(host: &Host, name: &str) -> Result<bool> {
    let out = host.probe(CommandSpec::new("dpkg-query").args(["-W", "-f=${Status}", name]))?;
    Ok(out.ok() && out.stdout.contains("install ok installed"))
}

/// Install `name` unless dpkg already reports it installed. Returns true when
/// an install was performed.
pub fn install_package_if_absent(host: &Host, name: &str) -> Result<bool> {
    if is_installed(host, name)? {
        debug!(package = name, "already installed");
        return Ok(false);
    }
    info!(package = name, "installing package");
    host.run(apt_get(&[
        "install",
        "-y",
        "-o",
        "Dpkg::Options::=--force-confold",
        name,
    ]))
    .map_err(|e| match e {
        ProvisionError::CommandFailed { stderr, .. } => {
            let reason = stderr.lines().last().unwrap_or("").trim().to_string();
            ProvisionError::PackageInstallFailed(if reason.is_empty() {
                name.to_string()
            } else {
                format!("{name}: {reason}")
            })
        }
        other => other,
    })?;
    info!(package = name, "installed");
    Ok(true)
}

/// Install each package in order; stops at the first failure.
pub fn install_packages(host: &Host, names: &[&str]) -> Result<usize> {
    let mut installed = 0;
    for name in names {
        if install_package_if_absent(host, name)? {
            installed += 1;
        }
    }
    Ok(installed)
}

pub fn update_index(host: &Host) -> Result<()> {
    info!("refreshing package index");
    host.run(apt_get(&["update"]))?;
    Ok(())
}

pub fn upgrade(host: &Host) -> Result<()> {
    info!("upgrading installed packages");
    host.run(apt_get(&[
        "upgrade",
        "-y",
        "-o",
        "Dpkg::Options::=--force-confold",
    ]))?;
    Ok(())
}

pub fn autoremove(host: &Host) -> Result<()> {
    host.run(apt_get(&["autoremove", "-y"]))?;
    Ok(())
}

/// Answer a debconf question ahead of install so the package does not prompt.
pub fn preseed(host: &Host, selection: &str) -> Result<()> {
    host.run(CommandSpec::new("debconf-set-selections").stdin(format!("{selection}\n")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::testing::{FakeFetcher, FakeRunner};

    #[test]
    fn skips_installed_package() {
        let runner = FakeRunner::new();
        runner.respond(
            "dpkg-query -W -f=${Status} ufw",
            CommandOutput::success("install ok installed"),
        );
        let fetcher = FakeFetcher::new();
        let host = Host::new(&runner, &fetcher);

        assert!(!install_package_if_absent(&host, "ufw").unwrap());
        assert!(!runner.ran("apt-get install"));
    }

    #[test]
    fn installs_absent_package_noninteractively() {
        let runner = FakeRunner::new();
        runner.fail("dpkg-query", "no packages found matching fail2ban");
        let fetcher = FakeFetcher::new();
        let host = Host::new(&runner, &fetcher);

        assert!(install_package_if_absent(&host, "fail2ban").unwrap());
        let install = runner
            .specs()
            .into_iter()
            .find(|s| s.program == "apt-get")
            .unwrap();
        assert!(install.args.contains(&"fail2ban".to_string()));
        assert!(install
            .env
            .contains(&("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())));
    }

    #[test]
    fn failed_install_is_package_error() {
        let runner = FakeRunner::new();
        runner.fail("dpkg-query", "");
        runner.fail("apt-get install", "E: Unable to locate package nosuchpkg");
        let fetcher = FakeFetcher::new();
        let host = Host::new(&runner, &fetcher);

        match install_package_if_absent(&host, "nosuchpkg") {
            Err(ProvisionError::PackageInstallFailed(msg)) => {
                assert!(msg.contains("Unable to locate package"))
            }
            other => panic!("expected PackageInstallFailed, got {other:?}"),
        }
    }

    #[test]
    fn install_packages_stops_at_first_failure() {
        let runner = FakeRunner::new();
        runner.fail("dpkg-query", "");
        runner.fail("apt-get install -y -o Dpkg::Options::=--force-confold git", "boom");
        let fetcher = FakeFetcher::new();
        let host = Host::new(&runner, &fetcher);

        assert!(install_packages(&host, &["curl", "git", "htop"]).is_err());
        assert!(runner.ran("apt-get install -y -o Dpkg::Options::=--force-confold curl"));
        assert!(!runner.ran("apt-get install -y -o Dpkg::Options::=--force-confold htop"));
    }
}
