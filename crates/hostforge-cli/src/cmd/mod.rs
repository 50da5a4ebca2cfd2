pub mod config;
pub mod run;
pub mod stages;
pub mod vpn;

use anyhow::Context;
use hostforge_core::config::{self as core_config, Config};
use hostforge_core::ProvisionError;
use rand::{distributions::Alphanumeric, Rng};
use std::path::{Path, PathBuf};

/// Load the configuration. A missing file is replaced by a template and the
/// command stops so the operator can fill it in.
pub fn load_or_scaffold(path: &Path) -> anyhow::Result<Config> {
    match Config::load(path) {
        Ok(config) => Ok(config),
        Err(ProvisionError::ConfigNotFound(_)) => {
            write_template(path)?;
            anyhow::bail!(
                "wrote a configuration template to {}: edit it, then re-run",
                path.display()
            )
        }
        Err(e) => Err(e).with_context(|| format!("failed to load {}", path.display())),
    }
}

pub fn write_template(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, core_config::template(&generate_password(24)))
        .with_context(|| format!("failed to write {}", path.display()))
}

/// LOG_FILE from the configuration, if it loads.
pub fn configured_log_file(path: &Path) -> Option<PathBuf> {
    Config::load(path)
        .ok()
        .map(|c| c.log_file)
        .filter(|p| !p.as_os_str().is_empty())
}

fn generate_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_password_is_alphanumeric() {
        let p = generate_password(24);
        assert_eq!(p.len(), 24);
        assert!(p.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(p, generate_password(24));
    }
}
