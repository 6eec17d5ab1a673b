//! [`WorkerPool`] implementation.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::WorkerError;

/// Error type a task may fail with.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

type Task = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;

/// Configuration for the [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum number of tasks running at once.
    pub ceiling: usize,
    /// Maximum number of tasks waiting for a free worker.
    pub queue_size: usize,
}

impl WorkerConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            ceiling: 4,
            queue_size: 4,
        }
    }

    /// Create a default config for production use.
    pub fn default_config() -> Self {
        Self {
            ceiling: 256,
            queue_size: 1024,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Returned `Ok`.
    Completed,
    /// Returned an error.
    Failed(String),
    /// Panicked or was cancelled.
    Panicked,
}

/// Counters for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Tasks currently executing.
    pub running: usize,
    /// Tasks waiting in the queue.
    pub queued: usize,
    /// Tasks that returned `Ok`.
    pub completed: u64,
    /// Tasks that returned an error.
    pub failed: u64,
    /// Tasks that panicked.
    pub panicked: u64,
    /// Submissions refused with [`WorkerError::TaskQueueFull`].
    pub rejected: u64,
}

#[derive(Default)]
struct Slots {
    running: usize,
    queue: VecDeque<Task>,
}

struct Shared {
    config: WorkerConfig,
    slots: Mutex<Slots>,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    rejected: AtomicU64,
}

impl Shared {
    fn record(&self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            TaskOutcome::Failed(reason) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(%reason, "worker task failed");
            }
            TaskOutcome::Panicked => {
                self.panicked.fetch_add(1, Ordering::Relaxed);
                warn!("worker task panicked");
            }
        }
    }
}

/// Bounded pool of tokio tasks with a FIFO overflow queue.
///
/// Cloning is cheap; clones share the same slots and counters.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Create a pool. Runners are spawned on demand.
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                slots: Mutex::new(Slots::default()),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                panicked: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    /// Run `task` now if a worker is free, queue it if the queue has room,
    /// or refuse it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F>(&self, task: F) -> Result<(), WorkerError>
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let task: Task = Box::pin(task);
        let mut slots = self.shared.slots.lock().expect("worker lock poisoned");

        if slots.running < self.shared.config.ceiling {
            slots.running += 1;
            drop(slots);
            let shared = self.shared.clone();
            tokio::spawn(run(shared, task));
            return Ok(());
        }

        if slots.queue.len() < self.shared.config.queue_size {
            slots.queue.push_back(task);
            debug!(queued = slots.queue.len(), "all workers busy, task queued");
            return Ok(());
        }

        drop(slots);
        self.shared.rejected.fetch_add(1, Ordering::Relaxed);
        Err(WorkerError::TaskQueueFull {
            capacity: self.shared.config.queue_size,
        })
    }

    /// Tasks currently executing.
    pub fn running(&self) -> usize {
        self.shared
            .slots
            .lock()
            .expect("worker lock poisoned")
            .running
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared
            .slots
            .lock()
            .expect("worker lock poisoned")
            .queue
            .len()
    }

    /// Snapshot of all counters.
    pub fn stats(&self) -> WorkerStats {
        let (running, queued) = {
            let slots = self.shared.slots.lock().expect("worker lock poisoned");
            (slots.running, slots.queue.len())
        };
        WorkerStats {
            running,
            queued,
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Runner loop: execute `task`, then keep pulling from the queue until it is
/// empty, then give the slot back.
async fn run(shared: Arc<Shared>, mut task: Task) {
    loop {
        let outcome = match tokio::spawn(task).await {
            Ok(Ok(())) => TaskOutcome::Completed,
            Ok(Err(e)) => TaskOutcome::Failed(e.to_string()),
            Err(e) if e.is_panic() => TaskOutcome::Panicked,
            Err(e) => TaskOutcome::Failed(e.to_string()),
        };
        shared.record(&outcome);

        task = {
            let mut slots = shared.slots.lock().expect("worker lock poisoned");
            match slots.queue.pop_front() {
                Some(next) => next,
                None => {
                    slots.running -= 1;
                    return;
                }
            }
        };
    }
}
