//! Portal configuration.
//!
//! Loaded from a TOML file (by default `portal.toml` in the config directory,
//! see [`crate::paths`]). Every section has defaults so a partial file is
//! enough; the hypervisor credentials and at least one tier are required.
//!
//! ```toml
//! [hypervisor]
//! host = "pve.lab"
//! user = "portal@pve"
//! token_name = "provision"
//! token_value = "…"
//! node = "pve"
//!
//! [guest]
//! bootstrap_user = "admin"
//! bootstrap_password = "…"
//! template_disk_gb = 8
//!
//! [[tiers]]
//! name = "small"
//! cores = 2
//! memory_mb = 1024
//! disk_gb = 15
//! template_id = 9000
//! ```
//!
//! Secrets may be supplied through the environment instead of the file:
//! `VM_PORTAL_TOKEN_VALUE` and `VM_PORTAL_BOOTSTRAP_PASSWORD` override the
//! corresponding keys.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::model::{GuestId, VmTier};

pub const TOKEN_VALUE_ENV: &str = "VM_PORTAL_TOKEN_VALUE";
pub const BOOTSTRAP_PASSWORD_ENV: &str = "VM_PORTAL_BOOTSTRAP_PASSWORD";

/// Shortest password the portal will hand out.
pub const MIN_PASSWORD_LENGTH: usize = 12;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PortalConfig {
    pub hypervisor: HypervisorConfig,
    pub guest: GuestConfig,
    pub timeouts: TimeoutConfig,
    pub tiers: Vec<TierConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Hostname or address of the API endpoint. May carry a scheme.
    pub host: String,
    pub port: u16,
    /// API principal, e.g. `portal@pve`.
    pub user: String,
    pub token_name: String,
    pub token_value: String,
    pub verify_ssl: bool,
    /// Node that receives every new guest.
    pub node: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8006,
            user: String::new(),
            token_name: String::new(),
            token_value: String::new(),
            verify_ssl: false,
            node: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuestConfig {
    /// Pre-existing account in every template with passwordless sudo.
    pub bootstrap_user: String,
    pub bootstrap_password: String,
    /// Root disk size of the templates; tiers above it get a resize.
    pub template_disk_gb: u32,
    pub password_length: usize,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            bootstrap_user: "admin".to_string(),
            bootstrap_password: String::new(),
            template_disk_gb: 8,
            password_length: 16,
        }
    }
}

/// Wait budgets, in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub clone_secs: u64,
    pub resize_secs: u64,
    pub start_secs: u64,
    pub discovery_secs: u64,
    pub bootstrap_secs: u64,
    pub command_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            clone_secs: 900,
            resize_secs: 300,
            start_secs: 300,
            discovery_secs: 120,
            bootstrap_secs: 180,
            command_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn clone_wait(&self) -> Duration {
        Duration::from_secs(self.clone_secs)
    }

    pub fn resize_wait(&self) -> Duration {
        Duration::from_secs(self.resize_secs)
    }

    pub fn start_wait(&self) -> Duration {
        Duration::from_secs(self.start_secs)
    }

    pub fn discovery_wait(&self) -> Duration {
        Duration::from_secs(self.discovery_secs)
    }

    pub fn bootstrap_wait(&self) -> Duration {
        Duration::from_secs(self.bootstrap_secs)
    }

    pub fn command_wait(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierConfig {
    pub name: String,
    pub cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub template_id: u32,
}

impl From<&TierConfig> for VmTier {
    fn from(t: &TierConfig) -> Self {
        VmTier {
            name: t.name.clone(),
            cores: t.cores,
            memory_mb: t.memory_mb,
            disk_gb: t.disk_gb,
            template_id: GuestId(t.template_id),
        }
    }
}

impl PortalConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Read, apply environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config = Self::from_toml(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override secrets from `lookup` (the process environment in
    /// production).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup(TOKEN_VALUE_ENV) {
            self.hypervisor.token_value = token;
        }
        if let Some(password) = lookup(BOOTSTRAP_PASSWORD_ENV) {
            self.guest.bootstrap_password = password;
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.hypervisor.host.is_empty(), "hypervisor.host is required");
        ensure!(!self.hypervisor.node.is_empty(), "hypervisor.node is required");
        ensure!(!self.hypervisor.user.is_empty(), "hypervisor.user is required");
        ensure!(!self.guest.bootstrap_user.is_empty(), "guest.bootstrap_user is required");
        ensure!(
            self.guest.password_length >= MIN_PASSWORD_LENGTH,
            "guest.password_length must be at least {MIN_PASSWORD_LENGTH}"
        );
        if self.tiers.is_empty() {
            bail!("at least one [[tiers]] entry is required");
        }
        for (i, tier) in self.tiers.iter().enumerate() {
            ensure!(!tier.name.is_empty(), "tiers[{i}].name is required");
            ensure!(tier.cores >= 1, "tier {:?} needs at least one core", tier.name);
            ensure!(tier.memory_mb >= 1, "tier {:?} needs memory", tier.name);
            ensure!(tier.disk_gb >= 1, "tier {:?} needs a disk", tier.name);
            if self.tiers[..i].iter().any(|t| t.name == tier.name) {
                bail!("duplicate tier {:?}", tier.name);
            }
        }
        Ok(())
    }

    pub fn tier(&self, name: &str) -> Option<VmTier> {
        self.tiers.iter().find(|t| t.name == name).map(VmTier::from)
    }
}
