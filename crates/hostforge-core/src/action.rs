//! Desired-state actions.
//!
//! An [`Action`] pairs a check ("does the host already look right?") with an
//! apply step. [`StageReport::ensure`] runs the check and applies only when
//! needed, recording which actions changed the host.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::error::Result;
use crate::firewall::{self, FirewallRule};
use crate::host::Host;
use crate::stage::StageId;
use crate::{io, packages, services};

pub trait Action {
    fn describe(&self) -> String;

    /// True when the desired state already holds and `apply` can be skipped.
    fn check(&self, host: &Host) -> Result<bool>;

    fn apply(&self, host: &Host) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Skipped,
}

// ---------------------------------------------------------------------------
// Step: closure-backed action
// ---------------------------------------------------------------------------

type CheckFn<'a> = Box<dyn Fn(&Host) -> Result<bool> + 'a>;
type ApplyFn<'a> = Box<dyn Fn(&Host) -> Result<()> + 'a>;

/// Ad hoc action built from closures. Without a check it always applies.
pub struct Step<'a> {
    name: String,
    check: Option<CheckFn<'a>>,
    apply: ApplyFn<'a>,
}

impl<'a> Step<'a> {
    pub fn new(name: impl Into<String>, apply: impl Fn(&Host) -> Result<()> + 'a) -> Self {
        Self {
            name: name.into(),
            check: None,
            apply: Box::new(apply),
        }
    }

    pub fn unless(mut self, check: impl Fn(&Host) -> Result<bool> + 'a) -> Self {
        self.check = Some(Box::new(check));
        self
    }
}

impl Action for Step<'_> {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn check(&self, host: &Host) -> Result<bool> {
        match &self.check {
            Some(check) => check(host),
            None => Ok(false),
        }
    }

    fn apply(&self, host: &Host) -> Result<()> {
        (self.apply)(host)
    }
}

// ---------------------------------------------------------------------------
// Built-in actions
// ---------------------------------------------------------------------------

pub struct InstallPackages<'a> {
    pub names: &'a [&'a str],
}

impl Action for InstallPackages<'_> {
    fn describe(&self) -> String {
        format!("install packages: {}", self.names.join(" "))
    }

    fn check(&self, host: &Host) -> Result<bool> {
        for name in self.names {
            if !packages::is_installed(host, name)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn apply(&self, host: &Host) -> Result<()> {
        packages::install_packages(host, self.names).map(|_| ())
    }
}

/// Write a config file. Always applies: an existing file is backed up and
/// replaced, so each run leaves one backup of what it overwrote.
pub struct WriteConfig {
    pub path: String,
    pub content: String,
    pub mode: Option<u32>,
}

impl WriteConfig {
    pub fn new(path: &str, content: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            content: content.into(),
            mode: None,
        }
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }
}

impl Action for WriteConfig {
    fn describe(&self) -> String {
        format!("write {}", self.path)
    }

    fn check(&self, _host: &Host) -> Result<bool> {
        Ok(false)
    }

    fn apply(&self, host: &Host) -> Result<()> {
        io::write_config_file(&host.path(&self.path), &self.content, self.mode)?;
        Ok(())
    }
}

pub struct AllowRules<'a> {
    pub rules: &'a [FirewallRule],
}

impl Action for AllowRules<'_> {
    fn describe(&self) -> String {
        let ports: Vec<String> = self
            .rules
            .iter()
            .map(|r| format!("{}/{}", r.port, r.proto))
            .collect();
        format!("firewall allow {}", ports.join(", "))
    }

    fn check(&self, _host: &Host) -> Result<bool> {
        // ensure_rule checks each rule itself
        Ok(false)
    }

    fn apply(&self, host: &Host) -> Result<()> {
        firewall::ensure_rules(host, self.rules).map(|_| ())
    }
}

/// Enable at boot and bring the unit up on its current configuration: a
/// running unit is restarted, a stopped one started.
pub struct EnableService<'a> {
    pub name: &'a str,
}

impl Action for EnableService<'_> {
    fn describe(&self) -> String {
        format!("start {}", self.name)
    }

    fn check(&self, _host: &Host) -> Result<bool> {
        Ok(false)
    }

    fn apply(&self, host: &Host) -> Result<()> {
        if services::is_active(host, self.name)? {
            services::enable_and_restart_service(host, self.name)
        } else {
            services::enable_and_verify_service(host, self.name)
        }
    }
}

// ---------------------------------------------------------------------------
// StageReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub action: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: StageId,
    pub actions: Vec<ActionRecord>,
    pub warnings: Vec<String>,
    /// Files the stage produced for the operator to pick up.
    pub artifacts: Vec<PathBuf>,
    /// Values discovered while running, e.g. the resolved VPN endpoint.
    pub outputs: BTreeMap<String, String>,
}

impl StageReport {
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            actions: Vec::new(),
            warnings: Vec::new(),
            artifacts: Vec::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Run `action` unless its check says the host is already in shape.
    pub fn ensure(&mut self, host: &Host, action: &dyn Action) -> Result<Outcome> {
        let name = action.describe();
        let outcome = if action.check(host)? {
            info!(stage = %self.stage, action = %name, "skipped: already in place");
            Outcome::Skipped
        } else {
            info!(stage = %self.stage, action = %name, "applying");
            action.apply(host)?;
            Outcome::Applied
        };
        self.actions.push(ActionRecord {
            action: name,
            outcome,
        });
        Ok(outcome)
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(stage = %self.stage, "{message}");
        self.warnings.push(message);
    }

    pub fn artifact(&mut self, path: impl Into<PathBuf>) {
        self.artifacts.push(path.into());
    }

    pub fn output(&mut self, key: &str, value: impl Into<String>) {
        self.outputs.insert(key.to_string(), value.into());
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.actions.iter().filter(|a| a.outcome == outcome).count()
    }
}
