//! The five provisioning stages.

pub mod alerting;
pub mod docker;
pub mod hardening;
pub mod monitoring;
pub mod wireguard;

use crate::stage::{Stage, StageId};

/// Download directory for release archives.
pub(crate) const DOWNLOAD_DIR: &str = "/tmp/hostforge";

pub fn stage_for(id: StageId) -> &'static dyn Stage {
    match id {
        StageId::Hardening => &hardening::Hardening,
        StageId::Docker => &docker::Docker,
        StageId::Wireguard => &wireguard::Wireguard,
        StageId::Monitoring => &monitoring::Monitoring,
        StageId::Alerting => &alerting::Alerting,
    }
}
