//! Fixed-interval polling against a wall-clock deadline.
//!
//! Shared by the task waiter, address discovery and the guest bootstrapper.
//! The deadline is computed once on entry; there is no backoff and no
//! external cancellation. A loop only ends when `poll` yields a value or the
//! deadline has passed.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// The deadline passed before `poll` produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTimeout;

/// Call `poll` every `interval` until it returns `Some`, or until `timeout`
/// has elapsed since entry.
///
/// `poll` is not invoked at all once the deadline has passed, so a zero
/// timeout returns [`PollTimeout`] without polling.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    timeout: Duration,
    mut poll: F,
) -> Result<T, PollTimeout>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if let Some(value) = poll().await {
            return Ok(value);
        }
        tokio::time::sleep(interval).await;
    }

    Err(PollTimeout)
}
