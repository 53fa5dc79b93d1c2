//! DHCP address discovery for a freshly started guest.
//!
//! The hypervisor reports the guest's interfaces once its network stack is
//! up. `eth0` carries the DHCP lease on our templates, so it is checked
//! first; loopback and link-local addresses are never accepted.

use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::hypervisor::{GuestInterface, HypervisorClient};
use crate::model::GuestId;
use crate::poll::poll_until;

pub const ADDRESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no routable IPv4 address reported by guest {0} in time")]
    Timeout(GuestId),
}

/// Strip a CIDR suffix and surrounding whitespace: `" 10.0.0.5/24"` →
/// `"10.0.0.5"`.
pub fn normalize_ip(raw: &str) -> &str {
    raw.split('/').next().unwrap_or(raw).trim()
}

/// Parse `raw` (CIDR suffix allowed) and accept it only if it is a
/// routable IPv4 address: not loopback and not link-local.
pub fn parse_routable_ipv4(raw: &str) -> Option<Ipv4Addr> {
    let addr: Ipv4Addr = normalize_ip(raw).parse().ok()?;
    (!addr.is_loopback() && !addr.is_link_local()).then_some(addr)
}

/// First acceptable address across `interfaces`, `eth0` first and the
/// remaining interfaces in reported order.
pub fn select_ipv4(interfaces: &[GuestInterface]) -> Option<Ipv4Addr> {
    let mut ordered: Vec<&GuestInterface> = interfaces.iter().collect();
    // sort_by_key is stable
    ordered.sort_by_key(|iface| iface.name.as_deref() != Some("eth0"));

    ordered
        .into_iter()
        .flat_map(|iface| iface.inet_candidates())
        .find_map(parse_routable_ipv4)
}

/// Poll the guest's interfaces until a routable IPv4 address appears.
pub async fn wait_guest_ipv4(
    client: &dyn HypervisorClient,
    node: &str,
    guest: GuestId,
    timeout: Duration,
) -> Result<Ipv4Addr, DiscoveryError> {
    poll_until(ADDRESS_POLL_INTERVAL, timeout, move || async move {
        match client.interfaces(node, guest).await {
            Ok(interfaces) => {
                let found = select_ipv4(&interfaces);
                if found.is_none() {
                    debug!(%guest, count = interfaces.len(), "No routable address yet");
                }
                found
            }
            Err(e) => {
                warn!(%guest, error = %e, "Interface poll failed");
                None
            }
        }
    })
    .await
    .map_err(|_| DiscoveryError::Timeout(guest))
}
