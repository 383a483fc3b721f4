//! Backoff for idempotent store operations. Writes are never routed
//! through here: they surface after a single attempt and the caller
//! decides.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use hypervisor_types::Result;

const DEFAULT_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Run an idempotent operation, retrying transient (`unavailable`) failures
/// with exponential backoff. Spec and state errors are returned on first
/// sight.
pub async fn idempotent<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = INITIAL_BACKOFF;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < DEFAULT_ATTEMPTS => {
                debug!(what, attempt, error = %err, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}
