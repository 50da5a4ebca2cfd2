//! Upstream release resolution and binary download.
//!
//! Release metadata comes from the GitHub API (`/repos/<project>/releases/latest`).
//! Archives follow the Prometheus project naming scheme:
//! `<binary>-<version>.linux-<arch>.tar.gz`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::ReleaseSources;
use crate::error::{ProvisionError, Result};
use crate::exec::CommandSpec;
use crate::host::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    pub fn from_machine(machine: &str) -> Result<Self> {
        match machine.trim() {
            "x86_64" | "amd64" => Ok(Arch::Amd64),
            "aarch64" | "arm64" => Ok(Arch::Arm64),
            other => Err(ProvisionError::UnsupportedArch(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }
}

pub fn detect_arch(host: &Host) -> Result<Arch> {
    let out = host.run(CommandSpec::new("uname").arg("-m"))?;
    Arch::from_machine(out.stdout_trimmed())
}

#[derive(Debug, Deserialize)]
struct LatestRelease {
    #[serde(default)]
    tag_name: String,
}

/// Newest published tag of `project` (`owner/repo`), e.g. `v1.8.2`.
pub fn resolve_latest_release(
    host: &Host,
    sources: &ReleaseSources,
    project: &str,
) -> Result<String> {
    let url = format!("{}/repos/{project}/releases/latest", sources.api_url);
    let body = host.fetcher().get_text(&url)?;
    let release: LatestRelease = serde_json::from_str(&body)?;
    let tag = release.tag_name.trim().to_string();
    if tag.is_empty() {
        return Err(ProvisionError::ReleaseNotFound(project.to_string()));
    }
    info!(project, tag = %tag, "resolved latest release");
    Ok(tag)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseArchive {
    pub path: PathBuf,
    pub tag: String,
    pub version: String,
    pub arch: Arch,
}

impl ReleaseArchive {
    /// Directory the tarball unpacks into, relative to the download dir.
    pub fn dir_name(&self, binary: &str) -> String {
        format!("{binary}-{}.linux-{}", self.version, self.arch.as_str())
    }
}

pub fn archive_url(
    sources: &ReleaseSources,
    project: &str,
    binary: &str,
    tag: &str,
    arch: Arch,
) -> String {
    let version = tag.trim_start_matches('v');
    format!(
        "{}/{project}/releases/download/{tag}/{binary}-{version}.linux-{}.tar.gz",
        sources.download_url,
        arch.as_str()
    )
}

/// Resolve the latest tag and architecture, then download the archive into
/// `dest_dir` (a host-absolute path).
pub fn fetch_release_archive(
    host: &Host,
    sources: &ReleaseSources,
    project: &str,
    binary: &str,
    dest_dir: &str,
) -> Result<ReleaseArchive> {
    let arch = detect_arch(host)?;
    let tag = resolve_latest_release(host, sources, project)?;
    let version = tag.trim_start_matches('v').to_string();
    let url = archive_url(sources, project, binary, &tag, arch);
    let file_name = format!("{binary}-{version}.linux-{}.tar.gz", arch.as_str());
    let path = Path::new(dest_dir).join(&file_name);

    info!(url = %url, "downloading release archive");
    host.fetcher().download(&url, &host.path(&path))?;

    Ok(ReleaseArchive {
        path,
        tag,
        version,
        arch,
    })
}

/// Unpack `archive` and install `binaries` from it into `/usr/local/bin`.
pub fn install_release_binaries(
    host: &Host,
    archive: &ReleaseArchive,
    binary: &str,
    binaries: &[&str],
) -> Result<()> {
    let dest_dir = archive
        .path
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/tmp".to_string());
    host.run(CommandSpec::new("tar").args([
        "-xzf".to_string(),
        host.arg_path(&archive.path.display().to_string()),
        "-C".to_string(),
        host.arg_path(&dest_dir),
    ]))?;
    let unpacked = format!("{dest_dir}/{}", archive.dir_name(binary));
    for bin in binaries {
        host.run(CommandSpec::new("install").args([
            "-m".to_string(),
            "0755".to_string(),
            host.arg_path(&format!("{unpacked}/{bin}")),
            host.arg_path(&format!("/usr/local/bin/{bin}")),
        ]))?;
        info!(binary = bin, version = %archive.version, "installed");
    }
    Ok(())
}
