//! hostforge-core: idempotent provisioning of a single Debian/Ubuntu VPS.
//!
//! The [`pipeline::Pipeline`] drives five [`stage::StageId`]s in order. Each
//! stage is a sequence of [`action::Action`]s executed against a
//! [`host::Host`], which owns every side effect: commands go through a
//! [`exec::CommandRunner`], network access through a [`fetch::Fetcher`], and
//! file paths are resolved under the host's root.

pub mod action;
pub mod config;
pub mod error;
pub mod exec;
pub mod fetch;
pub mod firewall;
pub mod host;
pub mod io;
pub mod packages;
pub mod pipeline;
pub mod release;
pub mod services;
pub mod stage;
pub mod stages;
pub mod testing;

pub use error::{ProvisionError, Result};
