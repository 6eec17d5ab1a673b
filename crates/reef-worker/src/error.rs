//! Error types for the worker pool.

/// Errors returned by [`WorkerPool::submit`](crate::WorkerPool::submit).
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Every worker is busy and the wait queue is full.
    #[error("task queue full ({capacity} waiting)")]
    TaskQueueFull {
        /// Configured wait-queue size.
        capacity: usize,
    },
}
