//! Deterministic worker driven by a virtual clock.
//!
//! Submitted tasks run inline on the caller's thread. Delayed tasks are
//! recorded and only run when [`ManualWorker::advance`] moves virtual time
//! past their deadline. An attached [`FakeClock`] is moved in lockstep, so
//! code that reads wall time sees the same instant the timer fired at.

use crate::{CancellableHandle, FakeClock, Task, TaskPriority, Worker};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Timer {
    deadline: Duration,
    task: Task,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    timers: Vec<Timer>,
    history: Vec<Duration>,
}

struct CancelFlag(Arc<AtomicBool>);

impl CancellableHandle for CancelFlag {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Worker that runs submitted tasks inline and delayed tasks on demand.
#[derive(Default)]
pub struct ManualWorker {
    state: Mutex<ManualState>,
    clock: Option<Arc<FakeClock>>,
}

impl ManualWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `clock` forward whenever virtual time advances.
    pub fn with_clock(clock: Arc<FakeClock>) -> Self {
        Self {
            state: Mutex::new(ManualState::default()),
            clock: Some(clock),
        }
    }

    /// Delays of the timers that are still pending, in scheduling order.
    pub fn pending_delays(&self) -> Vec<Duration> {
        let state = self.state.lock();
        state
            .timers
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .map(|t| t.deadline.saturating_sub(state.now))
            .collect()
    }

    /// Every delay ever passed to `schedule_after`, cancelled or not.
    pub fn scheduled_history(&self) -> Vec<Duration> {
        self.state.lock().history.clone()
    }

    /// Advance virtual time by `by`, running every timer that falls due.
    pub fn advance(&self, by: Duration) {
        let target = self.state.lock().now + by;
        while let Some(task) = self.take_due(target) {
            task();
        }
        self.move_to(target);
    }

    /// Jump to the earliest pending timer and run it. Returns false if none.
    pub fn fire_next(&self) -> bool {
        let next = {
            let state = self.state.lock();
            state
                .timers
                .iter()
                .filter(|t| !t.cancelled.load(Ordering::SeqCst))
                .map(|t| t.deadline)
                .min()
        };
        match next {
            Some(deadline) => match self.take_due(deadline) {
                Some(task) => {
                    task();
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    fn take_due(&self, target: Duration) -> Option<Task> {
        let (task, elapsed) = {
            let mut state = self.state.lock();
            state.timers.retain(|t| !t.cancelled.load(Ordering::SeqCst));

            let index = state
                .timers
                .iter()
                .enumerate()
                .filter(|(_, t)| t.deadline <= target)
                .min_by_key(|(_, t)| t.deadline)
                .map(|(i, _)| i)?;

            let timer = state.timers.remove(index);
            let elapsed = timer.deadline.saturating_sub(state.now);
            state.now = state.now.max(timer.deadline);
            (timer.task, elapsed)
        };

        if let Some(clock) = &self.clock {
            clock.advance(elapsed);
        }
        Some(task)
    }

    fn move_to(&self, target: Duration) {
        let elapsed = {
            let mut state = self.state.lock();
            let elapsed = target.saturating_sub(state.now);
            state.now = state.now.max(target);
            elapsed
        };
        if let Some(clock) = &self.clock {
            clock.advance(elapsed);
        }
    }
}

impl Worker for ManualWorker {
    fn submit(&self, _priority: TaskPriority, task: Task) {
        task();
    }

    fn schedule_after(&self, delay: Duration, task: Task) -> Box<dyn CancellableHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.state.lock();
        let deadline = state.now + delay;
        state.history.push(delay);
        state.timers.push(Timer {
            deadline,
            task,
            cancelled: cancelled.clone(),
        });
        Box::new(CancelFlag(cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Clock;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> Task {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn submit_runs_inline() {
        let worker = ManualWorker::new();
        let counter = Arc::new(AtomicUsize::new(0));
        worker.submit(TaskPriority::Low, counter_task(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timers_fire_only_when_due() {
        let worker = ManualWorker::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let _h = worker.schedule_after(Duration::from_secs(10), counter_task(&counter));

        worker.advance(Duration::from_secs(9));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(worker.pending_delays(), vec![Duration::from_secs(1)]);

        worker.advance(Duration::from_secs(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(worker.pending_delays().is_empty());
    }

    #[test]
    fn cancelled_timer_is_skipped() {
        let worker = ManualWorker::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = worker.schedule_after(Duration::from_secs(1), counter_task(&counter));
        handle.cancel();

        worker.advance(Duration::from_secs(5));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(worker.scheduled_history(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn fire_next_moves_attached_clock() {
        let clock = Arc::new(FakeClock::new(0));
        let worker = ManualWorker::with_clock(clock.clone());
        let counter = Arc::new(AtomicUsize::new(0));
        let _h = worker.schedule_after(Duration::from_secs(120), counter_task(&counter));

        assert!(worker.fire_next());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(clock.now_ms(), 120_000);
        assert!(!worker.fire_next());
    }

    #[test]
    fn timer_scheduled_from_a_timer_runs_in_same_advance() {
        let worker = Arc::new(ManualWorker::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let inner_worker = worker.clone();
        let inner_counter = counter.clone();
        let _h = worker.schedule_after(
            Duration::from_secs(1),
            Box::new(move || {
                let _ = inner_worker.schedule_after(
                    Duration::from_secs(1),
                    counter_task(&inner_counter),
                );
            }),
        );

        worker.advance(Duration::from_secs(3));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
