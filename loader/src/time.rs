//! This module provides timing helpers to pace or bound asynchronous operations.

use std::future::Future;

use tokio::time::Duration;

pub use tokio::time::error::Elapsed;

/// Wait for `duration`.
///
/// ```
/// # tokio_test::block_on(async {
/// # use std::time::Duration;
/// let started = tokio::time::Instant::now();
///
/// segment_loader::time::delay(Duration::from_millis(10)).await;
///
/// assert!(started.elapsed() >= Duration::from_millis(10));
/// # })
/// ```
#[inline]
pub async fn delay(duration: Duration) {
    tokio::time::sleep(duration).await
}

/// Race `future` against a [`delay`] of `duration`.
///
/// Whichever loses the race is dropped, so the raced operation is cancelled if the deadline elapses first.
pub async fn deadline<F: Future>(duration: Duration, future: F) -> Result<F::Output, Elapsed> {
    tokio::time::timeout(duration, future)
        .await
        .inspect_err(|_| tracing::debug!("Deadline of {duration:?} elapsed"))
}
