//! Racing suspension points against cancellation.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, PipelineResult};

/// Await `fut` unless `cancel` fires first.
///
/// Cancellation is checked before polling `fut`, so an already-cancelled
/// token never starts the operation.
pub async fn guard<F: Future>(cancel: &CancellationToken, fut: F) -> PipelineResult<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Sleep for `duration` unless cancelled.
pub async fn sleep(cancel: &CancellationToken, duration: std::time::Duration) -> PipelineResult<()> {
    guard(cancel, tokio::time::sleep(duration)).await
}
