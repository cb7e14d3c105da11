use std::future::Future;
use std::time::Duration;

use ferry_protocol::{FerryError, Result};

/// Runs `fut` under a deadline. Expiry maps to a connection error so the
/// caller's retry logic treats it like any other transient network fault.
pub(crate) async fn timed<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(FerryError::Connection(format!(
            "{what} timed out after {limit:?}"
        ))),
    }
}
