//! Bounded admission for in-flight tasks.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Upper limit on concurrently running tasks.
pub const MAX_IN_FLIGHT: usize = 5;

/// `min(5, available parallelism + 1)`.
pub fn default_bound() -> usize {
    let parallelism = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    MAX_IN_FLIGHT.min(parallelism + 1)
}

/// Admission gate bounding how many tasks run at once.
///
/// Tasks beyond the bound wait in FIFO order and a slot is released whenever
/// a running task completes, whether it succeeded or failed.
#[derive(Clone, Debug)]
pub struct Limiter {
    permits: Arc<Semaphore>,
    bound: usize,
}

impl Limiter {
    pub fn new() -> Self {
        Self::with_bound(default_bound())
    }

    /// A limiter admitting at most `bound` tasks at once (at least one).
    pub fn with_bound(bound: usize) -> Self {
        let bound = bound.max(1);
        Self {
            permits: Arc::new(Semaphore::new(bound)),
            bound,
        }
    }

    /// Maximum number of concurrently running tasks.
    pub fn bound(&self) -> usize {
        self.bound
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.bound - self.permits.available_permits()
    }

    /// Run `task` once a slot is free.
    ///
    /// The task is not started until it is admitted.
    pub async fn run<F, Fut>(&self, task: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        // The semaphore is never closed, so acquiring only ever waits.
        let _permit = self.permits.acquire().await.ok();
        task().await
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new()
    }
}
