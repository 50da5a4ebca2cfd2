//! In-memory test doubles for [`CommandRunner`] and [`Fetcher`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{ProvisionError, Result};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::fetch::Fetcher;

/// Scriptable command runner.
///
/// Responses are keyed by command-line prefix; the longest matching prefix
/// wins and one-shot responses are consumed before standing ones. Commands
/// with no scripted response succeed with empty output.
#[derive(Default)]
pub struct FakeRunner {
    standing: RefCell<Vec<(String, CommandOutput)>>,
    once: RefCell<Vec<(String, CommandOutput)>>,
    calls: RefCell<Vec<CommandSpec>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        let mut standing = self.standing.borrow_mut();
        standing.retain(|(p, _)| p != prefix);
        standing.push((prefix.to_string(), output));
    }

    pub fn respond_once(&self, prefix: &str, output: CommandOutput) {
        self.once.borrow_mut().push((prefix.to_string(), output));
    }

    pub fn fail(&self, prefix: &str, stderr: &str) {
        self.respond(prefix, CommandOutput::failure(1, stderr));
    }

    /// Every command line run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().iter().map(CommandSpec::display).collect()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.count(prefix) > 0
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }
}

fn longest_match(entries: &[(String, CommandOutput)], line: &str) -> Option<usize> {
    entries
        .iter()
        .enumerate()
        .filter(|(_, (prefix, _))| line.starts_with(prefix.as_str()))
        .max_by_key(|(_, (prefix, _))| prefix.len())
        .map(|(i, _)| i)
}

impl CommandRunner for FakeRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.borrow_mut().push(spec.clone());
        let line = spec.display();

        {
            let mut once = self.once.borrow_mut();
            if let Some(i) = longest_match(&once, &line) {
                return Ok(once.remove(i).1);
            }
        }
        let standing = self.standing.borrow();
        Ok(longest_match(&standing, &line)
            .map(|i| standing[i].1.clone())
            .unwrap_or_else(|| CommandOutput::success("")))
    }
}

/// URL-keyed fetcher that serves canned bodies.
#[derive(Default)]
pub struct FakeFetcher {
    bodies: RefCell<HashMap<String, String>>,
    requests: RefCell<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, body: &str) {
        self.bodies
            .borrow_mut()
            .insert(url.to_string(), body.to_string());
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }

    pub fn requested(&self, needle: &str) -> bool {
        self.requests.borrow().iter().any(|u| u.contains(needle))
    }

    fn lookup(&self, url: &str) -> Result<String> {
        self.requests.borrow_mut().push(url.to_string());
        self.bodies
            .borrow()
            .get(url)
            .cloned()
            .ok_or_else(|| ProvisionError::Download {
                url: url.to_string(),
                message: "HTTP 404 Not Found".to_string(),
            })
    }
}

impl Fetcher for FakeFetcher {
    fn get_text(&self, url: &str) -> Result<String> {
        self.lookup(url)
    }

    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let body = self.lookup(url)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, body)?;
        Ok(())
    }
}
