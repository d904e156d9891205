//! Deadlines and cancellation around transport I/O.

use std::future::Future;
use std::time::Duration;

use super::cancel::CancelSignal;
use crate::error::{Error, Result};

/// Run `fut` under `timeout`. A zero timeout means no deadline.
pub(crate) async fn deadline<T, F>(fut: F, operation: &'static str, timeout: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout { operation, timeout }),
    }
}

/// `deadline`, additionally aborted by `cancel`.
pub(crate) async fn guarded<T, F>(
    fut: F,
    operation: &'static str,
    timeout: Duration,
    cancel: Option<&mut CancelSignal>,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(cancel) = cancel else {
        return deadline(fut, operation, timeout).await;
    };
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = deadline(fut, operation, timeout) => res,
    }
}
