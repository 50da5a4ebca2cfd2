use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Console logging plus, when `file` can be opened, a plain-text copy appended
/// to it. `RUST_LOG` overrides `default_level`.
pub fn init(default_level: tracing::Level, file: Option<&Path>) {
    let filter = || EnvFilter::from_default_env().add_directive(default_level.into());

    let console = fmt::layer().with_target(false).with_filter(filter());

    let mut open_error = None;
    let file_layer = file.and_then(|path| {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(f))
                    .with_filter(filter()),
            ),
            Err(e) => {
                open_error = Some(format!("{}: {e}", path.display()));
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .init();

    if let Some(err) = open_error {
        tracing::warn!("cannot open log file {err}, logging to console only");
    }
}
