//! Retry-until-timeout helper for step actions.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::StepError;

/// Calls `op` until it succeeds, sleeping `interval` between attempts.
///
/// Once `total` has elapsed the last error is returned. Errors that abort
/// the run are returned immediately.
///
/// # Errors
///
/// Returns the last error from `op`, or [`StepError::Cancelled`] when
/// `cancel` fires while waiting.
pub async fn try_until_timeout<T, F, Fut>(
    cancel: &CancellationToken,
    interval: Duration,
    total: Duration,
    mut op: F,
) -> Result<T, StepError>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, StepError>> + Send,
{
    let started = Instant::now();
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if err.aborts_run() || started.elapsed() >= total {
            return Err(err);
        }
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = cancel.cancelled() => return Err(StepError::Cancelled),
        }
    }
}
