//! Waits for a long-running hypervisor task to stop.

use std::time::Duration;

use tracing::{debug, warn};

use crate::hypervisor::HypervisorClient;
use crate::model::TaskHandle;
use crate::poll::poll_until;

pub const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("hypervisor task did not finish in time")]
    Timeout,

    #[error("hypervisor task failed: {0}")]
    Failed(String),
}

/// Poll `task` until it reports `stopped`, then classify its exit status.
///
/// Poll errors are not fatal: they are logged and the next poll retries,
/// so a hypervisor that stays unreachable only runs the clock down to
/// [`TaskError::Timeout`].
pub async fn wait_task(
    client: &dyn HypervisorClient,
    node: &str,
    task: &TaskHandle,
    timeout: Duration,
) -> Result<(), TaskError> {
    let outcome = poll_until(TASK_POLL_INTERVAL, timeout, move || async move {
        match client.task_status(node, task).await {
            Ok(status) if status.is_stopped() => Some(match status.exitstatus.as_deref() {
                Some("OK") => Ok(()),
                Some(code) => Err(TaskError::Failed(code.to_string())),
                None => Err(TaskError::Failed("<none>".to_string())),
            }),
            Ok(status) => {
                debug!(%task, status = %status.status, "Task still running");
                None
            }
            Err(e) => {
                warn!(%task, error = %e, "Task status poll failed");
                None
            }
        }
    })
    .await;

    outcome.unwrap_or(Err(TaskError::Timeout))
}
