//! Drives one approved request from PENDING to READY or FAILED.
//!
//! ```text
//! load request ─► resolve tier ─► reserve id ─► clone ─► (resize) ─► configure
//!     ─► start ─► discover IPv4 ─► create account ─► mark READY
//!                          any failure ─► mark FAILED (guest left in place)
//! ```
//!
//! Each run is independent: it owns no shared state besides the store, so
//! several approvals can be provisioned on separate tasks at once.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{Instrument, error, info, info_span, warn};

use crate::bootstrap::{BootstrapError, GuestBootstrapper, Login};
use crate::config::{MIN_PASSWORD_LENGTH, PortalConfig};
use crate::discovery::{DiscoveryError, wait_guest_ipv4};
use crate::hypervisor::{GuestResources, HypervisorClient, HypervisorError};
use crate::model::{
    GuestCredentials, GuestId, ProvisioningRequest, RequestId, RequestStatus, guest_hostname,
};
use crate::password::generate_password;
use crate::shell::{RemoteExecutor, ShellTransport};
use crate::store::{ProvisioningStore, StoreError};
use crate::task_waiter::{TaskError, wait_task};

/// Disk grown when a tier is larger than its template.
pub const ROOT_DISK: &str = "rootfs";

// ---------------------------------------------------------------------------
// Outcome and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Ready(GuestCredentials),
    /// The request was marked FAILED with this reason.
    Failed(String),
    /// The request was not PENDING; nothing was done.
    NotPending(RequestStatus),
    /// Another run already claimed the request; nothing was done.
    InProgress,
}

/// Hypervisor-side step of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    ReserveId,
    Clone,
    Resize,
    Configure,
    Start,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisionStep::ReserveId => "guest id reservation",
            ProvisionStep::Clone => "clone",
            ProvisionStep::Resize => "disk resize",
            ProvisionStep::Configure => "configuration",
            ProvisionStep::Start => "start",
        };
        f.write_str(s)
    }
}

impl ProvisionStep {
    fn request_failed(self) -> impl FnOnce(HypervisorError) -> ProvisionError {
        move |source| ProvisionError::Hypervisor { step: self, source }
    }

    fn task_failed(self) -> impl FnOnce(TaskError) -> ProvisionError {
        move |source| ProvisionError::Task { step: self, source }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("unknown tier {0:?}")]
    UnknownTier(String),

    #[error("{step} request failed")]
    Hypervisor {
        step: ProvisionStep,
        #[source]
        source: HypervisorError,
    },

    #[error("{step} did not complete")]
    Task {
        step: ProvisionStep,
        #[source]
        source: TaskError,
    },

    #[error("address discovery failed")]
    Discovery(#[source] DiscoveryError),

    #[error("guest account setup failed")]
    Bootstrap(#[source] BootstrapError),
}

/// `outer: inner: innermost`, the form stored as a failure reason.
pub fn error_chain(err: &dyn StdError) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

pub struct Provisioner {
    hypervisor: Arc<dyn HypervisorClient>,
    transport: Arc<dyn ShellTransport>,
    store: Arc<dyn ProvisioningStore>,
    config: Arc<PortalConfig>,
}

impl Provisioner {
    pub fn new(
        hypervisor: Arc<dyn HypervisorClient>,
        transport: Arc<dyn ShellTransport>,
        store: Arc<dyn ProvisioningStore>,
        config: Arc<PortalConfig>,
    ) -> Self {
        Self { hypervisor, transport, store, config }
    }

    /// Provision request `id`.
    ///
    /// The request is claimed in the store first, so a second run for the
    /// same id (in this process or another) returns
    /// [`ProvisionOutcome::InProgress`] without touching the hypervisor.
    /// Provisioning failures are recorded on the request and returned as
    /// [`ProvisionOutcome::Failed`]; only store errors surface as `Err`.
    pub async fn provision(&self, id: RequestId) -> Result<ProvisionOutcome, StoreError> {
        self.run(id)
            .instrument(info_span!("provision", request_id = %id))
            .await
    }

    async fn run(&self, id: RequestId) -> Result<ProvisionOutcome, StoreError> {
        let request = match self.store.claim(id).await {
            Ok(request) => request,
            Err(StoreError::NotPending { status, .. }) => {
                warn!(%status, "Request is not pending, skipping");
                return Ok(ProvisionOutcome::NotPending(status));
            }
            Err(StoreError::AlreadyClaimed(_)) => {
                warn!("Request is already being provisioned, skipping");
                return Ok(ProvisionOutcome::InProgress);
            }
            Err(e) => return Err(e),
        };

        info!(username = %request.username, tier = %request.tier, "Provisioning started");

        let mut guest = None;
        match self.build(&request, &mut guest).await {
            Ok(credentials) => {
                if let Err(e) = self.store.mark_ready(id, credentials.clone()).await {
                    error!(error = %e, "Could not record ready guest");
                    if let Some(guest) = guest {
                        warn!(%guest, "Guest left in place; remove it manually");
                    }
                    return Err(e);
                }
                info!(
                    hostname = %credentials.hostname,
                    ip = %credentials.ip_address,
                    "Request ready"
                );
                Ok(ProvisionOutcome::Ready(credentials))
            }
            Err(e) => {
                let reason = error_chain(&e);
                error!(%reason, "Provisioning failed");
                if let Some(guest) = guest {
                    warn!(%guest, "Guest left in place; remove it manually");
                }
                self.store.mark_failed(id, &reason).await?;
                Ok(ProvisionOutcome::Failed(reason))
            }
        }
    }

    /// Everything between "pending" and "ready". `guest` is filled in as
    /// soon as an id is reserved so the caller can report it on failure.
    async fn build(
        &self,
        request: &ProvisioningRequest,
        guest: &mut Option<GuestId>,
    ) -> Result<GuestCredentials, ProvisionError> {
        let config = self.config.as_ref();
        let timeouts = &config.timeouts;
        let hypervisor = self.hypervisor.as_ref();
        let node = config.hypervisor.node.as_str();

        let tier = config
            .tier(&request.tier)
            .ok_or_else(|| ProvisionError::UnknownTier(request.tier.clone()))?;

        let id = hypervisor
            .next_guest_id()
            .await
            .map_err(ProvisionStep::ReserveId.request_failed())?;
        *guest = Some(id);
        let hostname = guest_hostname(&request.username, id);

        // ---- Clone --------------------------------------------------------
        info!(guest = %id, template = %tier.template_id, %hostname, "Cloning template");
        let task = hypervisor
            .clone_guest(node, tier.template_id, id, &hostname)
            .await
            .map_err(ProvisionStep::Clone.request_failed())?;
        wait_task(hypervisor, node, &task, timeouts.clone_wait())
            .await
            .map_err(ProvisionStep::Clone.task_failed())?;

        // ---- Resize -------------------------------------------------------
        let template_disk = config.guest.template_disk_gb;
        if tier.disk_gb > template_disk {
            let delta = format!("+{}G", tier.disk_gb - template_disk);
            info!(guest = %id, %delta, "Growing root disk");
            let task = hypervisor
                .resize_disk(node, id, ROOT_DISK, &delta)
                .await
                .map_err(ProvisionStep::Resize.request_failed())?;
            wait_task(hypervisor, node, &task, timeouts.resize_wait())
                .await
                .map_err(ProvisionStep::Resize.task_failed())?;
        }

        // ---- Configure + start --------------------------------------------
        let resources = GuestResources {
            cores: tier.cores,
            memory_mb: tier.memory_mb,
            hostname: hostname.clone(),
        };
        hypervisor
            .configure(node, id, &resources)
            .await
            .map_err(ProvisionStep::Configure.request_failed())?;

        let task = hypervisor
            .start(node, id)
            .await
            .map_err(ProvisionStep::Start.request_failed())?;
        wait_task(hypervisor, node, &task, timeouts.start_wait())
            .await
            .map_err(ProvisionStep::Start.task_failed())?;
        info!(guest = %id, "Guest started");

        // ---- Address + account --------------------------------------------
        let ip = wait_guest_ipv4(hypervisor, node, id, timeouts.discovery_wait())
            .await
            .map_err(ProvisionError::Discovery)?;
        info!(guest = %id, %ip, "Guest address discovered");

        let password = generate_password(config.guest.password_length.max(MIN_PASSWORD_LENGTH));
        let bootstrap = Login::new(
            config.guest.bootstrap_user.clone(),
            config.guest.bootstrap_password.clone(),
        );
        let account = Login::new(request.username.clone(), password.clone());

        let executor = RemoteExecutor::new(self.transport.as_ref());
        GuestBootstrapper::new(executor, timeouts.command_wait())
            .create_user(&ip.to_string(), &bootstrap, &account, true, timeouts.bootstrap_wait())
            .await
            .map_err(ProvisionError::Bootstrap)?;

        Ok(GuestCredentials {
            request_id: request.id,
            hostname,
            ip_address: ip,
            username: request.username.clone(),
            password,
            created_at: Utc::now(),
        })
    }
}
