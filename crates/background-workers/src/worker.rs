//! Dedicated background worker backed by its own tokio runtime.
//!
//! Every [`RuntimeWorker`] owns a single-threaded tokio runtime. A dispatcher
//! task drains two channels (high priority first) and hands each task to
//! `spawn_blocking`, awaiting it before taking the next one. This gives:
//!
//! 1. **Serial execution**: one task at a time, FIFO within a priority
//! 2. **Blocking is fine**: tasks run outside async context, so file I/O and
//!    blocking transports do not stall the dispatcher's timers
//! 3. **Best-effort cancellation**: a delayed task can be cancelled while it
//!    is still sleeping; once queued for execution it runs to completion

use crate::{WorkerError, WorkerResult};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error};

/// A unit of background work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Execution priority of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskPriority {
    /// Runs before any queued low-priority task.
    High,
    /// Best-effort work that yields to high-priority tasks.
    Low,
}

/// Handle to a delayed task that can still be cancelled before it starts.
pub trait CancellableHandle: Send + Sync {
    /// Cancel the task if it has not started executing yet.
    fn cancel(&self);
}

/// A background worker that runs submitted tasks off the caller's thread.
pub trait Worker: Send + Sync {
    /// Queue a task for execution.
    fn submit(&self, priority: TaskPriority, task: Task);

    /// Run a task once `delay` has elapsed.
    fn schedule_after(&self, delay: Duration, task: Task) -> Box<dyn CancellableHandle>;
}

struct AbortOnCancel(AbortHandle);

impl CancellableHandle for AbortOnCancel {
    fn cancel(&self) {
        self.0.abort();
    }
}

/// Tokio-backed serial worker.
pub struct RuntimeWorker {
    name: String,
    high: mpsc::UnboundedSender<Task>,
    low: mpsc::UnboundedSender<Task>,
    runtime: Option<Runtime>,
}

impl RuntimeWorker {
    /// Start a worker whose threads are named after `name`.
    pub fn new(name: &str) -> WorkerResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .thread_name(name)
            .enable_time()
            .build()
            .map_err(|source| WorkerError::Spawn {
                name: name.to_string(),
                source,
            })?;

        let (high, mut high_rx) = mpsc::unbounded_channel::<Task>();
        let (low, mut low_rx) = mpsc::unbounded_channel::<Task>();

        let worker_name = name.to_string();
        runtime.spawn(async move {
            loop {
                let task = tokio::select! {
                    biased;
                    Some(task) = high_rx.recv() => task,
                    Some(task) = low_rx.recv() => task,
                    else => break,
                };

                if let Err(e) = tokio::task::spawn_blocking(task).await {
                    error!(worker = %worker_name, error = %e, "Background task panicked");
                }
            }
            debug!(worker = %worker_name, "Worker dispatcher stopped");
        });

        debug!(worker = %name, "Worker started");

        Ok(Self {
            name: name.to_string(),
            high,
            low,
            runtime: Some(runtime),
        })
    }

    /// Get the worker name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Worker for RuntimeWorker {
    fn submit(&self, priority: TaskPriority, task: Task) {
        let sender = match priority {
            TaskPriority::High => &self.high,
            TaskPriority::Low => &self.low,
        };
        if sender.send(task).is_err() {
            debug!(worker = %self.name, "Worker stopped, task dropped");
        }
    }

    fn schedule_after(&self, delay: Duration, task: Task) -> Box<dyn CancellableHandle> {
        let high = self.high.clone();
        let sleeper = async move {
            tokio::time::sleep(delay).await;
            let _ = high.send(task);
        };

        match &self.runtime {
            Some(runtime) => Box::new(AbortOnCancel(runtime.spawn(sleeper).abort_handle())),
            None => Box::new(AlreadyStopped),
        }
    }
}

impl Drop for RuntimeWorker {
    fn drop(&mut self) {
        // The last owner may be a task running on this very runtime.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

struct AlreadyStopped;

impl CancellableHandle for AlreadyStopped {
    fn cancel(&self) {}
}
