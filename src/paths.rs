//! Directory layout for vm-portal.
//!
//! - Config: `$XDG_CONFIG_HOME/vm-portal/` (or `~/.config/vm-portal/`), holds
//!   `portal.toml`.
//! - Data:   `$XDG_DATA_HOME/vm-portal/` (or `~/.local/share/vm-portal/`),
//!   holds the request store.
//! - Logs:   `<data>/logs/`, written only when file logging is enabled.

use std::path::{Path, PathBuf};

const APP_NAME: &str = "vm-portal";

pub const CONFIG_FILE: &str = "portal.toml";
pub const STORE_FILE: &str = "requests.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalPaths {
    pub config: PathBuf,
    pub data: PathBuf,
    pub logs: PathBuf,
}

impl PortalPaths {
    /// Resolve from the process environment. `None` without `$HOME`.
    /// Creates nothing: the store and the file logger create their own
    /// directories.
    pub fn resolve() -> Option<Self> {
        Self::resolve_with(|key| std::env::var(key).ok())
    }

    /// Resolve using `lookup` for environment variables.
    pub fn resolve_with(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let home = lookup("HOME").map(PathBuf::from)?;
        let config = xdg_dir(&lookup, "XDG_CONFIG_HOME", &home, &[".config"]);
        let data = xdg_dir(&lookup, "XDG_DATA_HOME", &home, &[".local", "share"]);
        Some(Self { config, logs: data.join("logs"), data })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join(CONFIG_FILE)
    }

    pub fn store_file(&self) -> PathBuf {
        self.data.join(STORE_FILE)
    }
}

fn xdg_dir(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    home: &Path,
    fallback: &[&str],
) -> PathBuf {
    match lookup(var).filter(|v| !v.is_empty()) {
        Some(base) => PathBuf::from(base).join(APP_NAME),
        None => fallback.iter().fold(home.to_path_buf(), |p, part| p.join(part)).join(APP_NAME),
    }
}
