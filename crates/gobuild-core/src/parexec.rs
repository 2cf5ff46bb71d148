//! Bounded-concurrency task runner with first-error capture and cooperative cancellation.
//!
//! Every fan-out in the crate (dependency discovery, cache walks, cache
//! materialization, version discovery) goes through a [`ParallelExecutor`]:
//! a counting semaphore caps the number of tasks doing work at once, a
//! [`TaskTracker`] acts as the wait-group, and the first real error is kept
//! while errors caused by cancellation are dropped.
//!
//! Tasks may spawn further tasks on a clone of the executor. `wait` returns
//! only once every task, including those spawned while waiting, has finished.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Marker error for work that stopped because its operation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Errors produced by executor tasks.
pub trait TaskError: From<Cancelled> + Send + 'static {
    /// True if this error only reports cancellation.
    fn is_cancelled(&self) -> bool;
}

impl TaskError for Cancelled {
    fn is_cancelled(&self) -> bool {
        true
    }
}

impl TaskError for anyhow::Error {
    fn is_cancelled(&self) -> bool {
        self.downcast_ref::<Cancelled>().is_some()
    }
}

/// What happens to outstanding work once a task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Cancel the shared token: queued tasks never start and running tasks
    /// observe cancellation at their next check. Later errors are discarded.
    CancelOnError,
    /// Keep the first error and let every other task run to completion.
    CollectFirst,
}

struct Inner<E> {
    semaphore: Semaphore,
    tracker: TaskTracker,
    token: CancellationToken,
    first_error: Mutex<Option<E>>,
    policy: FailurePolicy,
}

pub struct ParallelExecutor<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for ParallelExecutor<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> std::fmt::Debug for ParallelExecutor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("available", &self.inner.semaphore.available_permits())
            .field("tasks", &self.inner.tracker.len())
            .field("cancelled", &self.inner.token.is_cancelled())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl<E: TaskError> ParallelExecutor<E> {
    pub fn new(workers: usize, policy: FailurePolicy) -> Self {
        Self::with_token(workers, policy, CancellationToken::new())
    }

    /// Creates an executor driven by an existing cancellation token, so that
    /// cancelling the caller's token also stops this executor's work.
    pub fn with_token(workers: usize, policy: FailurePolicy, token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                semaphore: Semaphore::new(workers.max(1)),
                tracker: TaskTracker::new(),
                token,
                first_error: Mutex::new(None),
                policy,
            }),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Returns `Err(Cancelled)` once the operation has been cancelled.
    ///
    /// Long-running tasks call this at loop boundaries.
    pub fn check(&self) -> Result<(), E> {
        if self.is_cancelled() {
            Err(E::from(Cancelled))
        } else {
            Ok(())
        }
    }

    /// Queues `task`. It starts once a worker slot is free, unless the
    /// operation is cancelled first.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            let permit = tokio::select! {
                biased;
                () = inner.token.cancelled() => return,
                permit = inner.semaphore.acquire() => permit,
            };
            let Ok(_permit) = permit else {
                return;
            };
            if inner.token.is_cancelled() {
                return;
            }
            if let Err(e) = task.await {
                inner.record(e);
            }
        });
    }

    /// Waits for every queued and running task, then reports the outcome.
    ///
    /// The first real error wins. If the operation was cancelled from
    /// outside and no task failed, `Cancelled` is returned.
    pub async fn wait(&self) -> Result<(), E> {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let first = self
            .inner
            .first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match first {
            Some(e) => Err(e),
            None if self.is_cancelled() => Err(E::from(Cancelled)),
            None => Ok(()),
        }
    }
}

impl<E: TaskError> Inner<E> {
    fn record(&self, error: E) {
        if error.is_cancelled() {
            return;
        }
        let mut slot = self.first_error.lock().unwrap_or_else(PoisonError::into_inner);
        match self.policy {
            FailurePolicy::CancelOnError => {
                if slot.is_none() && !self.token.is_cancelled() {
                    *slot = Some(error);
                    self.token.cancel();
                } else {
                    tracing::debug!("Discarding error after cancellation");
                }
            }
            FailurePolicy::CollectFirst => {
                if slot.is_none() {
                    *slot = Some(error);
                }
            }
        }
    }
}
