//! Background execution and time sources for the delivery layer.
//!
//! This crate provides:
//! - [`Worker`]: submit work to a dedicated background worker, or schedule it after a delay
//! - [`RuntimeWorker`]: tokio-backed worker executing tasks serially on its own runtime
//! - [`ManualWorker`]: deterministic worker driven by a virtual clock
//! - [`Clock`]: wall-clock source, with [`SystemClock`] and [`FakeClock`]

mod clock;
mod error;
mod manual;
mod worker;

pub use clock::{Clock, FakeClock, SystemClock};
pub use error::{WorkerError, WorkerResult};
pub use manual::ManualWorker;
pub use worker::{CancellableHandle, RuntimeWorker, Task, TaskPriority, Worker};
