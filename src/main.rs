//! vm-portal: request, approve and track self-service VMs.
//!
//! ```text
//! vm-portal submit --user alice --tier small
//! vm-portal list
//! vm-portal approve 3 4
//! vm-portal credentials --user alice
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::{error, info};

use vm_portal::bootstrap::is_valid_username;
use vm_portal::config::PortalConfig;
use vm_portal::hypervisor::ProxmoxClient;
use vm_portal::logging;
use vm_portal::model::{RequestId, RequestStatus};
use vm_portal::orchestrator::{ProvisionOutcome, Provisioner};
use vm_portal::paths::PortalPaths;
use vm_portal::shell::SshTransport;
use vm_portal::store::{JsonStore, ProvisioningStore};

/// Self-service VM provisioning portal
#[derive(Parser, Debug)]
#[command(name = "vm-portal", version, about = "Self-service VM provisioning portal")]
struct Args {
    /// Configuration file (default: $XDG_CONFIG_HOME/vm-portal/portal.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Request store file (default: $XDG_DATA_HOME/vm-portal/requests.json)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a new request for a VM
    Submit {
        #[arg(long)]
        user: String,
        #[arg(long)]
        tier: String,
    },
    /// List requests, newest first
    List {
        #[arg(long)]
        user: Option<String>,
    },
    /// Reject a pending request
    Reject { id: u64 },
    /// Approve and provision pending requests, one task per distinct id
    Approve {
        #[arg(required = true)]
        ids: Vec<u64>,
    },
    /// Show a user's VM credentials
    Credentials {
        #[arg(long)]
        user: String,
    },
    /// List configured tiers
    Tiers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = logging::init();
    let args = Args::parse();

    let paths = PortalPaths::resolve();
    let config_path = match (&args.config, &paths) {
        (Some(path), _) => path.clone(),
        (None, Some(paths)) => paths.config_file(),
        (None, None) => bail!("HOME is not set; pass --config"),
    };
    let store_path = match (&args.store, &paths) {
        (Some(path), _) => path.clone(),
        (None, Some(paths)) => paths.store_file(),
        (None, None) => bail!("HOME is not set; pass --store"),
    };

    let store = JsonStore::open(&store_path)
        .await
        .with_context(|| format!("failed to open store {}", store_path.display()))?;

    match args.command {
        Command::Submit { user, tier } => {
            let config = load_config(&config_path)?;
            if !is_valid_username(&user) {
                bail!("invalid username {user:?}: only ASCII letters and digits are allowed");
            }
            if config.tier(&tier).is_none() {
                bail!("unknown tier {tier:?} (see `vm-portal tiers`)");
            }
            let request = store.submit(&user, &tier).await?;
            println!("{}", request.id);
        }

        Command::List { user } => {
            for request in store.list().await? {
                if user.as_deref().is_some_and(|u| u != request.username) {
                    continue;
                }
                let note = match (&request.failure_reason, request.claimed_at) {
                    (Some(reason), _) => reason.as_str(),
                    (None, Some(_)) if request.status == RequestStatus::Pending => "(provisioning)",
                    _ => "",
                };
                println!(
                    "{:>5}  {:<12} {:<10} {:<9} {}  {}",
                    request.id,
                    request.username,
                    request.tier,
                    request.status,
                    request.created_at.format("%Y-%m-%d %H:%M"),
                    note
                );
            }
        }

        Command::Reject { id } => {
            store.reject(RequestId(id)).await?;
            println!("request {id} rejected");
        }

        Command::Approve { ids } => {
            let config = Arc::new(load_config(&config_path)?);
            let hypervisor = ProxmoxClient::new(&config.hypervisor)
                .context("failed to build hypervisor client")?;
            let provisioner = Arc::new(Provisioner::new(
                Arc::new(hypervisor),
                Arc::new(SshTransport),
                Arc::new(store),
                config,
            ));
            approve(provisioner, ids).await?;
        }

        Command::Credentials { user } => {
            let found = store.credentials_for_user(&user).await?;
            if found.is_empty() {
                println!("no VMs ready for {user}");
            }
            for creds in found {
                println!(
                    "request {}: ssh {}@{}  ({})  password: {}",
                    creds.request_id, creds.username, creds.ip_address, creds.hostname, creds.password
                );
            }
        }

        Command::Tiers => {
            let config = load_config(&config_path)?;
            for tier in &config.tiers {
                println!(
                    "{:<12} {} cores, {} MiB, {} GiB (template {})",
                    tier.name, tier.cores, tier.memory_mb, tier.disk_gb, tier.template_id
                );
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<PortalConfig> {
    let config = PortalConfig::load(path)?;
    info!(path = %path.display(), tiers = config.tiers.len(), "Loaded configuration");
    Ok(config)
}

/// Provision each request on its own task and report every outcome.
async fn approve(provisioner: Arc<Provisioner>, ids: Vec<u64>) -> Result<()> {
    let ids: BTreeSet<u64> = ids.into_iter().collect();
    let mut runs = JoinSet::new();
    for id in ids {
        let provisioner = Arc::clone(&provisioner);
        runs.spawn(async move {
            let id = RequestId(id);
            (id, provisioner.provision(id).await)
        });
    }

    let mut failures = 0usize;
    while let Some(joined) = runs.join_next().await {
        let (id, result) = joined.context("provisioning task panicked")?;
        match result {
            Ok(ProvisionOutcome::Ready(creds)) => {
                println!("request {id}: READY {} {}", creds.hostname, creds.ip_address);
            }
            Ok(ProvisionOutcome::Failed(reason)) => {
                failures += 1;
                println!("request {id}: FAILED {reason}");
            }
            Ok(ProvisionOutcome::NotPending(status)) => {
                failures += 1;
                println!("request {id}: skipped, already {status}");
            }
            Ok(ProvisionOutcome::InProgress) => {
                failures += 1;
                println!("request {id}: skipped, already being provisioned");
            }
            Err(e) => {
                failures += 1;
                error!(%id, error = %e, "Store error during provisioning");
                println!("request {id}: store error: {e}");
            }
        }
    }

    if failures > 0 {
        bail!("{failures} request(s) not provisioned");
    }
    Ok(())
}
