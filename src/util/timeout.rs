//! Timeout helpers.
//!
//! Every bounded wait in the crate (approval responses, sub-agent deadlines,
//! user-initiated stop) goes through [`race`]: the operation runs against a
//! timer and a cancellation token, and whichever side loses is dropped.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::WardenError;

/// Outcome of racing an operation against a deadline and a cancellation token.
#[derive(Debug, PartialEq, Eq)]
pub enum Race<T> {
    Completed(T),
    TimedOut,
    Canceled,
}

/// Race `future` against `duration` and `cancel`.
///
/// When the timer wins, `cancel` is triggered so work spawned under the token
/// stops as well; pass a child token scoped to the operation.
pub async fn race<F>(duration: Duration, cancel: &CancellationToken, future: F) -> Race<F::Output>
where
    F: Future,
{
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Race::Canceled,
        output = future => Race::Completed(output),
        _ = tokio::time::sleep(duration) => Race::TimedOut,
    };
    if matches!(outcome, Race::TimedOut) {
        cancel.cancel();
    }
    outcome
}

/// Wrap a future with a timeout.
pub async fn with_timeout<T>(
    duration: Duration,
    future: impl Future<Output = Result<T, WardenError>>,
) -> Result<T, WardenError> {
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(WardenError::Timeout(duration.as_millis() as u64)),
    }
}
