//! Bounded task execution.
//!
//! [`WorkerPool`] runs at most `ceiling` tasks at once and parks up to
//! `queue_size` more in FIFO order. When a task finishes, the runner that
//! carried it starts the next queued task straight away. Each task runs in
//! its own tokio task, so an error or a panic is captured as a
//! [`TaskOutcome`] and never reaches the submitter or other tasks.

mod error;
mod pool;

pub use error::WorkerError;
pub use pool::{TaskError, TaskOutcome, WorkerConfig, WorkerPool, WorkerStats};
