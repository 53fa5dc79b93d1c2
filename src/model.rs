//! Portal data model.
//!
//! Requests move through a one-way lifecycle:
//!
//! ```text
//! Pending ──► Ready     (provisioning succeeded, credentials stored)
//!    │   └──► Failed    (any provisioning step failed)
//!    └──────► Rejected  (administrator decision)
//! ```
//!
//! Every state other than `Pending` is terminal.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a provisioning request in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Hypervisor-side numeric guest identifier (Proxmox VMID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuestId(pub u32);

impl fmt::Display for GuestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a long-running hypervisor task (a UPID).
///
/// Consumed immediately by the task waiter; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle(pub String);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Ready,
    Rejected,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Ready => "READY",
            RequestStatus::Rejected => "REJECTED",
            RequestStatus::Failed => "FAILED",
        };
        f.pad(s)
    }
}

/// A user's request for a VM of a given tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    pub id: RequestId,
    /// Name of the requesting user; also the account created in the guest.
    pub username: String,
    /// Name of the requested tier (see [`VmTier::name`]).
    pub tier: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When a provisioner took the request. A claimed request stays
    /// `Pending` until its run ends but cannot be claimed again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Rendered cause of the failure, set only when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// A VM size preset. Read-only input to the provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmTier {
    pub name: String,
    pub cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    /// Guest id of the template that is cloned for this tier.
    pub template_id: GuestId,
}

/// Login details for a provisioned guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCredentials {
    pub request_id: RequestId,
    pub hostname: String,
    pub ip_address: Ipv4Addr,
    pub username: String,
    pub password: String,
    pub created_at: DateTime<Utc>,
}

/// Hostname given to a cloned guest: `vm-<username>-<guest id>`.
pub fn guest_hostname(username: &str, guest: GuestId) -> String {
    format!("vm-{username}-{guest}")
}
