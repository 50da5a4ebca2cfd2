use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("must be run as root (current uid: {0})")]
    NotPrivileged(String),

    #[error("unsupported platform: {detected} (supported: {supported})")]
    UnsupportedPlatform { detected: String, supported: String },

    #[error("unsupported architecture: {0} (supported: x86_64, aarch64)")]
    UnsupportedArch(String),

    #[error("configuration file not found: {0}")]
    ConfigNotFound(String),

    #[error("invalid configuration value for {key}: {message}")]
    InvalidConfig { key: String, message: String },

    #[error("program not found on PATH: {0}")]
    ProgramNotFound(String),

    #[error("failed to spawn '{program}': {message}")]
    CommandSpawn { program: String, message: String },

    #[error("command failed ({status}): {command}{}", stderr_suffix(.stderr))]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("package install failed: {0}")]
    PackageInstallFailed(String),

    #[error("service did not reach active state: {0}")]
    ServiceNotActive(String),

    #[error("no release found for {0}")]
    ReleaseNotFound(String),

    #[error("download failed for {url}: {message}")]
    Download { url: String, message: String },

    #[error("stage '{stage}' requires {missing}: run the earlier stages first")]
    DependencyMissing { stage: String, missing: String },

    #[error("unexpected command output from '{command}': {message}")]
    UnexpectedOutput { command: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
