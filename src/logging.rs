//! Logging initialisation for vm-portal.
//!
//! Log lines always go to stderr, filtered by `RUST_LOG` (default `info`).
//! When `VM_PORTAL_LOG=1`, they are also written to `vm-portal.log` in the
//! log directory (see [`crate::paths`]). Each provisioning run logs inside a
//! `provision{request_id=..}` span, so interleaved runs stay readable.
//!
//! The returned guard must be kept alive for the duration of the process so
//! buffered file output is flushed on exit.

use std::path::PathBuf;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::paths::PortalPaths;

pub const FILE_LOG_ENV: &str = "VM_PORTAL_LOG";
const LOG_FILE: &str = "vm-portal.log";

pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber. Call once from `main`.
pub fn init() -> LogGuard {
    let (file_layer, file_guard) = match file_writer() {
        Some((writer, guard)) => (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    LogGuard { _file_guard: file_guard }
}

fn file_log_enabled(lookup: impl Fn(&str) -> Option<String>) -> bool {
    lookup(FILE_LOG_ENV).as_deref() == Some("1")
}

/// The subscriber is not installed yet, so problems go straight to stderr.
fn file_writer() -> Option<(NonBlocking, WorkerGuard)> {
    if !file_log_enabled(|key| std::env::var(key).ok()) {
        return None;
    }
    let dir = log_dir();
    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("vm-portal: file logging disabled, cannot create {}: {e}", dir.display());
        return None;
    }
    Some(tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, LOG_FILE)))
}

fn log_dir() -> PathBuf {
    PortalPaths::resolve()
        .map(|p| p.logs)
        .unwrap_or_else(|| std::env::temp_dir().join("vm-portal"))
}
