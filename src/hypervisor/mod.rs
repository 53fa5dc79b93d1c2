//! Hypervisor collaborator used by the provisioner.
//!
//! The portal targets a single task/poll style API: long-running calls
//! (clone, resize, start) return a [`TaskHandle`] that is polled through
//! [`HypervisorClient::task_status`] until it stops. [`proxmox`] provides the
//! REST implementation; tests substitute scripted fakes.

use async_trait::async_trait;
use serde::Deserialize;

use crate::model::{GuestId, TaskHandle};

pub mod proxmox;

pub use proxmox::ProxmoxClient;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    #[error("hypervisor request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("hypervisor returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected hypervisor response: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Status of a hypervisor task.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskStatus {
    /// `"running"` while in progress, `"stopped"` once terminal.
    pub status: String,
    /// Set once stopped; `"OK"` means success.
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    pub fn is_stopped(&self) -> bool {
        self.status == "stopped"
    }
}

/// One network interface reported by a running guest.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct GuestInterface {
    #[serde(default)]
    pub name: Option<String>,
    /// Either a single `"a.b.c.d/nn"` string or a list of them.
    #[serde(default)]
    pub inet: Option<serde_json::Value>,
}

impl GuestInterface {
    /// Every string value carried by `inet`, in order. Non-string list
    /// entries are skipped.
    pub fn inet_candidates(&self) -> Vec<&str> {
        match &self.inet {
            Some(serde_json::Value::String(s)) => vec![s.as_str()],
            Some(serde_json::Value::Array(items)) => {
                items.iter().filter_map(|v| v.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// CPU, memory and hostname applied to a cloned guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestResources {
    pub cores: u32,
    pub memory_mb: u32,
    pub hostname: String,
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Reserve the next free guest id in the cluster.
    async fn next_guest_id(&self) -> Result<GuestId, HypervisorError>;

    /// Full (non-linked) clone of `template` into `new_id`.
    async fn clone_guest(
        &self,
        node: &str,
        template: GuestId,
        new_id: GuestId,
        hostname: &str,
    ) -> Result<TaskHandle, HypervisorError>;

    /// Grow `disk` by `delta` (e.g. `"+7G"`).
    async fn resize_disk(
        &self,
        node: &str,
        guest: GuestId,
        disk: &str,
        delta: &str,
    ) -> Result<TaskHandle, HypervisorError>;

    /// Synchronous configuration update; no task to wait on.
    async fn configure(
        &self,
        node: &str,
        guest: GuestId,
        config: &GuestResources,
    ) -> Result<(), HypervisorError>;

    async fn start(&self, node: &str, guest: GuestId) -> Result<TaskHandle, HypervisorError>;

    async fn task_status(
        &self,
        node: &str,
        task: &TaskHandle,
    ) -> Result<TaskStatus, HypervisorError>;

    /// Interfaces reported by the guest. An empty list when the guest does
    /// not (yet) report a list.
    async fn interfaces(
        &self,
        node: &str,
        guest: GuestId,
    ) -> Result<Vec<GuestInterface>, HypervisorError>;
}
