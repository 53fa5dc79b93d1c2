//! Proxmox VE REST implementation of [`HypervisorClient`].
//!
//! Guests are LXC containers addressed as `/nodes/{node}/lxc/{vmid}`. Every
//! response is wrapped in a `{"data": ...}` envelope; parameters are sent
//! form-encoded. Authentication uses an API token:
//!
//! ```text
//! Authorization: PVEAPIToken=<user>!<token_name>=<token_value>
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use super::{GuestResources, GuestInterface, HypervisorClient, HypervisorError, TaskStatus};
use crate::config::HypervisorConfig;
use crate::model::{GuestId, TaskHandle};

/// Per-request HTTP timeout. Long operations return a task handle right
/// away, so no single call should take long.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Clone)]
pub struct ProxmoxClient {
    base: Url,
    auth: String,
    client: Client,
}

impl ProxmoxClient {
    pub fn new(config: &HypervisorConfig) -> Result<Self, HypervisorError> {
        let base = api_base(&config.host, config.port)?;
        let client = Client::builder()
            .danger_accept_invalid_certs(!config.verify_ssl)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            base,
            auth: format!(
                "PVEAPIToken={}!{}={}",
                config.user, config.token_name, config.token_value
            ),
            client,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, HypervisorError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| HypervisorError::Decode(format!("{} cannot carry a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn lxc(&self, node: &str, guest: GuestId, rest: &[&str]) -> Result<Url, HypervisorError> {
        let id = guest.to_string();
        let mut segments = vec!["nodes", node, "lxc", id.as_str()];
        segments.extend_from_slice(rest);
        self.endpoint(&segments)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, HypervisorError> {
        let response = request.header(AUTHORIZATION, &self.auth).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HypervisorError::Status { status: status.as_u16(), body });
        }

        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.data)
    }

    async fn send_task(&self, request: RequestBuilder) -> Result<TaskHandle, HypervisorError> {
        let upid: String = self.send(request).await?;
        Ok(TaskHandle(upid))
    }
}

#[async_trait]
impl HypervisorClient for ProxmoxClient {
    async fn next_guest_id(&self) -> Result<GuestId, HypervisorError> {
        let url = self.endpoint(&["cluster", "nextid"])?;
        let data: serde_json::Value = self.send(self.client.get(url)).await?;
        parse_guest_id(&data)
    }

    async fn clone_guest(
        &self,
        node: &str,
        template: GuestId,
        new_id: GuestId,
        hostname: &str,
    ) -> Result<TaskHandle, HypervisorError> {
        let url = self.lxc(node, template, &["clone"])?;
        let params = [
            ("newid", new_id.to_string()),
            ("hostname", hostname.to_string()),
            ("full", "1".to_string()),
        ];
        debug!(%node, %template, %new_id, %hostname, "Cloning template");
        self.send_task(self.client.post(url).form(&params)).await
    }

    async fn resize_disk(
        &self,
        node: &str,
        guest: GuestId,
        disk: &str,
        delta: &str,
    ) -> Result<TaskHandle, HypervisorError> {
        let url = self.lxc(node, guest, &["resize"])?;
        let params = [("disk", disk), ("size", delta)];
        debug!(%node, %guest, disk, delta, "Resizing guest disk");
        self.send_task(self.client.put(url).form(&params)).await
    }

    async fn configure(
        &self,
        node: &str,
        guest: GuestId,
        config: &GuestResources,
    ) -> Result<(), HypervisorError> {
        let url = self.lxc(node, guest, &["config"])?;
        let params = [
            ("cores", config.cores.to_string()),
            ("memory", config.memory_mb.to_string()),
            ("hostname", config.hostname.clone()),
        ];
        let _: serde_json::Value = self.send(self.client.put(url).form(&params)).await?;
        Ok(())
    }

    async fn start(&self, node: &str, guest: GuestId) -> Result<TaskHandle, HypervisorError> {
        let url = self.lxc(node, guest, &["status", "start"])?;
        self.send_task(self.client.post(url)).await
    }

    async fn task_status(
        &self,
        node: &str,
        task: &TaskHandle,
    ) -> Result<TaskStatus, HypervisorError> {
        let url = self.endpoint(&["nodes", node, "tasks", task.0.as_str(), "status"])?;
        self.send(self.client.get(url)).await
    }

    async fn interfaces(
        &self,
        node: &str,
        guest: GuestId,
    ) -> Result<Vec<GuestInterface>, HypervisorError> {
        let url = self.lxc(node, guest, &["interfaces"])?;
        let data: serde_json::Value = self.send(self.client.get(url)).await?;
        Ok(parse_interfaces(data))
    }
}

/// Build `https://<host>:<port>/api2/json`. A host given with an explicit
/// scheme is used as is, minus any trailing slash.
fn api_base(host: &str, port: u16) -> Result<Url, HypervisorError> {
    let raw = if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}/api2/json", host.trim_end_matches('/'))
    } else {
        format!("https://{host}:{port}/api2/json")
    };
    Url::parse(&raw).map_err(|e| HypervisorError::Decode(format!("invalid host {host:?}: {e}")))
}

/// `/cluster/nextid` answers with the id as a string on most versions and
/// as a number on some.
fn parse_guest_id(data: &serde_json::Value) -> Result<GuestId, HypervisorError> {
    let id = match data {
        serde_json::Value::String(s) => s.trim().parse::<u32>().ok(),
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        _ => None,
    };
    id.map(GuestId)
        .ok_or_else(|| HypervisorError::Decode(format!("invalid guest id: {data}")))
}

fn parse_interfaces(data: serde_json::Value) -> Vec<GuestInterface> {
    match data {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item) {
                Ok(iface) => Some(iface),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed interface entry");
                    None
                }
            })
            .collect(),
        other => {
            debug!(data = %other, "Guest did not report an interface list");
            Vec::new()
        }
    }
}
