//! Wall-clock deadlines around offloaded blocking work.
//!
//! The extractor call is a blocking operation on a worker thread; elapsing
//! the deadline cannot preempt that thread. The guard therefore signals the
//! cancellation token (for extractors that can stop early), detaches the
//! worker, and hands its eventual late result to a discard hook so nothing
//! it produced is leaked. Best-effort by design: the worker may keep
//! running to completion in the background.

use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of running a task under a deadline
#[derive(Debug)]
pub enum DeadlineOutcome<T> {
    /// The task finished in time
    Finished(T),
    /// The deadline elapsed; the task was detached and its late result
    /// will be discarded
    TimedOut,
}

/// Await `task` for at most `deadline`.
///
/// On expiry the `cancel` token is triggered and a detached reaper awaits
/// the task purely to run `discard` over whatever it eventually returns.
pub async fn bound_task<T, F>(
    deadline: Duration,
    cancel: CancellationToken,
    mut task: JoinHandle<T>,
    discard: F,
) -> DeadlineOutcome<Result<T, JoinError>>
where
    T: Send + 'static,
    F: FnOnce(T) + Send + 'static,
{
    match tokio::time::timeout(deadline, &mut task).await {
        Ok(res) => DeadlineOutcome::Finished(res),
        Err(_) => {
            debug!(?deadline, "deadline elapsed, detaching worker");
            cancel.cancel();
            tokio::spawn(async move {
                if let Ok(value) = task.await {
                    discard(value);
                }
            });
            DeadlineOutcome::TimedOut
        }
    }
}
