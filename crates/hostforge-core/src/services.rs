//! systemd service control.

use tracing::info;

use crate::error::{ProvisionError, Result};
use crate::exec::CommandSpec;
use crate::host::Host;

fn systemctl<'s>(args: impl IntoIterator<Item = &'s str>) -> CommandSpec {
    CommandSpec::new("systemctl").args(args)
}

pub fn is_active(host: &Host, name: &str) -> Result<bool> {
    Ok(host
        .probe(systemctl(["is-active", "--quiet", name]))?
        .ok())
}

pub fn is_enabled(host: &Host, name: &str) -> Result<bool> {
    Ok(host.probe(systemctl(["is-enabled", "--quiet", name]))?.ok())
}

fn verify_active(host: &Host, name: &str) -> Result<()> {
    if !is_active(host, name)? {
        return Err(ProvisionError::ServiceNotActive(name.to_string()));
    }
    info!(service = name, "service active");
    Ok(())
}

/// Enable at boot, start, then check once that the unit reached `active`.
pub fn enable_and_verify_service(host: &Host, name: &str) -> Result<()> {
    host.run(systemctl(["enable", name]))?;
    host.run(systemctl(["start", name]))?;
    verify_active(host, name)
}

pub fn restart_and_verify_service(host: &Host, name: &str) -> Result<()> {
    host.run(systemctl(["restart", name]))?;
    verify_active(host, name)
}

/// Enable at boot and restart so a running unit picks up new configuration.
pub fn enable_and_restart_service(host: &Host, name: &str) -> Result<()> {
    host.run(systemctl(["enable", name]))?;
    restart_and_verify_service(host, name)
}

/// Stop and disable `name` if it is enabled. Returns true if it was.
pub fn disable_if_enabled(host: &Host, name: &str) -> Result<bool> {
    if !is_enabled(host, name)? {
        return Ok(false);
    }
    host.run(systemctl(["disable", "--now", name]))?;
    info!(service = name, "disabled");
    Ok(true)
}

pub fn daemon_reload(host: &Host) -> Result<()> {
    host.run(systemctl(["daemon-reload"]))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::testing::{FakeFetcher, FakeRunner};

    #[test]
    fn enable_restart_then_verify() {
        let runner = FakeRunner::new();
        let fetcher = FakeFetcher::new();
        let host = Host::new(&runner, &fetcher);

        enable_and_restart_service(&host, "docker").unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "systemctl enable docker",
                "systemctl restart docker",
                "systemctl is-active --quiet docker",
            ]
        );
    }

    #[test]
    fn enable_start_then_verify() {
        let runner = FakeRunner::new();
        let fetcher = FakeFetcher::new();
        let host = Host::new(&runner, &fetcher);

        enable_and_verify_service(&host, "wg-quick@wg0").unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "systemctl enable wg-quick@wg0",
                "systemctl start wg-quick@wg0",
                "systemctl is-active --quiet wg-quick@wg0",
            ]
        );
    }

    #[test]
    fn inactive_service_fails() {
        let runner = FakeRunner::new();
        runner.respond(
            "systemctl is-active --quiet grafana-server",
            CommandOutput::failure(3, ""),
        );
        let fetcher = FakeFetcher::new();
        let host = Host::new(&runner, &fetcher);

        assert!(matches!(
            enable_and_verify_service(&host, "grafana-server"),
            Err(ProvisionError::ServiceNotActive(name)) if name == "grafana-server"
        ));
    }

    #[test]
    fn disable_only_when_enabled() {
        let runner = FakeRunner::new();
        runner.respond(
            "systemctl is-enabled --quiet telnet.socket",
            CommandOutput::failure(1, ""),
        );
        let fetcher = FakeFetcher::new();
        let host = Host::new(&runner, &fetcher);

        assert!(!disable_if_enabled(&host, "telnet.socket").unwrap());
        assert!(disable_if_enabled(&host, "rsh.socket").unwrap());
        assert!(!runner.ran("systemctl disable --now telnet.socket"));
        assert!(runner.ran("systemctl disable --now rsh.socket"));
    }
}
