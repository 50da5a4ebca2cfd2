use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::{ProvisionError, Result};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::fetch::Fetcher;

/// The machine being provisioned: how to run commands on it, how to reach the
/// network from it, and where its filesystem is rooted.
pub struct Host<'a> {
    runner: &'a dyn CommandRunner,
    fetcher: &'a dyn Fetcher,
    root: PathBuf,
}

impl<'a> Host<'a> {
    pub fn new(runner: &'a dyn CommandRunner, fetcher: &'a dyn Fetcher) -> Self {
        Self::with_root(runner, fetcher, "/")
    }

    /// Root every absolute host path under `root`. Used by tests to point
    /// the stages at a scratch directory.
    pub fn with_root(
        runner: &'a dyn CommandRunner,
        fetcher: &'a dyn Fetcher,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            fetcher,
            root: root.into(),
        }
    }

    pub fn fetcher(&self) -> &dyn Fetcher {
        self.fetcher
    }

    /// Map an absolute path on the host to a path under the configured root.
    pub fn path(&self, absolute: impl AsRef<Path>) -> PathBuf {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix("/").unwrap_or(absolute);
        self.root.join(relative)
    }

    /// Host-absolute string form of a path, for arguments to host commands.
    /// Identity when rooted at `/`.
    pub fn arg_path(&self, absolute: &str) -> String {
        self.path(absolute).display().to_string()
    }

    /// Run a command that must succeed.
    pub fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec.display(), "run");
        let out = self.runner.run(&spec)?;
        if !out.ok() {
            return Err(ProvisionError::CommandFailed {
                command: spec.display(),
                status: out.status_label(),
                stderr: out.stderr,
            });
        }
        Ok(out)
    }

    /// Run a command whose exit status is an answer, not a failure.
    pub fn probe(&self, spec: CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec.display(), "probe");
        self.runner.run(&spec)
    }

    pub fn exists(&self, absolute: &str) -> bool {
        self.path(absolute).exists()
    }

    pub fn user_exists(&self, name: &str) -> Result<bool> {
        Ok(self.probe(CommandSpec::new("id").args(["-u", name]))?.ok())
    }

    pub fn user_in_group(&self, user: &str, group: &str) -> Result<bool> {
        let groups = self.run(CommandSpec::new("id").args(["-nG", user]))?;
        Ok(groups.stdout.split_whitespace().any(|g| g == group))
    }

    pub fn group_exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .probe(CommandSpec::new("getent").args(["group", name]))?
            .ok())
    }
}

// ---------------------------------------------------------------------------
// Preconditions
// ---------------------------------------------------------------------------

/// Platform/version pairs the stages are written against.
pub const SUPPORTED_PLATFORMS: &[(&str, &str)] = &[
    ("ubuntu", "22.04"),
    ("ubuntu", "24.04"),
    ("debian", "11"),
    ("debian", "12"),
];

pub const OS_RELEASE: &str = "/etc/os-release";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OsRelease {
    pub id: String,
    pub version_id: String,
    pub codename: String,
    pub pretty_name: String,
}

impl OsRelease {
    pub fn parse(content: &str) -> Self {
        let mut rel = OsRelease::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "ID" => rel.id = value,
                "VERSION_ID" => rel.version_id = value,
                "VERSION_CODENAME" => rel.codename = value,
                "PRETTY_NAME" => rel.pretty_name = value,
                _ => {}
            }
        }
        rel
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_PLATFORMS
            .iter()
            .any(|(id, ver)| *id == self.id && *ver == self.version_id)
    }

    fn label(&self) -> String {
        if self.pretty_name.is_empty() {
            format!("{} {}", self.id, self.version_id).trim().to_string()
        } else {
            self.pretty_name.clone()
        }
    }
}

pub fn read_os_release(host: &Host) -> Result<OsRelease> {
    let content = std::fs::read_to_string(host.path(OS_RELEASE))?;
    Ok(OsRelease::parse(&content))
}

pub fn require_elevated_privileges(host: &Host) -> Result<()> {
    let out = host.run(CommandSpec::new("id").arg("-u"))?;
    let uid = out.stdout_trimmed();
    if uid != "0" {
        return Err(ProvisionError::NotPrivileged(uid.to_string()));
    }
    Ok(())
}

pub fn require_supported_platform(host: &Host) -> Result<OsRelease> {
    let rel = match read_os_release(host) {
        Ok(rel) => rel,
        Err(ProvisionError::Io(_)) => {
            return Err(ProvisionError::UnsupportedPlatform {
                detected: format!("unknown ({OS_RELEASE} not readable)"),
                supported: supported_list(),
            })
        }
        Err(e) => return Err(e),
    };
    if !rel.is_supported() {
        return Err(ProvisionError::UnsupportedPlatform {
            detected: rel.label(),
            supported: supported_list(),
        });
    }
    Ok(rel)
}

fn supported_list() -> String {
    SUPPORTED_PLATFORMS
        .iter()
        .map(|(id, ver)| format!("{id} {ver}"))
        .collect::<Vec<_>>()
        .join(", ")
}
