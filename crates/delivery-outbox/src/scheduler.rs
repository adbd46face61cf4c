//! Retry scheduler.
//!
//! Owns the single outstanding delayed drain task. State transitions:
//!
//! - `Idle -> Scheduled`: a wake (enqueue, reachability regained, cooldown
//!   elapsed, explicit request) finds deliverable calls
//! - `Scheduled -> Draining`: the delay elapses while the network is reachable
//! - `Scheduled -> Idle`: the network is lost before the delay elapses
//! - `Draining -> Idle | Scheduled`: one full pass over the queue finished
//!
//! Calls that need another attempt are buffered during a pass and put back
//! only once it finishes, so every call is tried at most once per pass.
//! Passes with transient failures double the next delay from the base
//! period. Once the delay would exceed the cap, scheduling stops until the
//! next cold start.

use crate::{
    NetworkStatus, OutboxResult, PendingCall, PendingCallQueue, RateLimiter, SendOutcome, Sender,
};
use background_workers::{CancellableHandle, Task, TaskPriority, Worker};
use parking_lot::Mutex;
use payload_cache_registry::CacheRegistry;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shortest base period the scheduler runs with. A zero base would never
/// grow past the cap.
pub const MIN_RETRY_PERIOD: Duration = Duration::from_secs(1);

/// Backoff bounds of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_retry_period: Duration,
    pub max_retry_period: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_retry_period: Duration::from_secs(120),
            max_retry_period: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    Scheduled,
    Draining,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub phase: SchedulerPhase,
    pub next_backoff: Duration,
    pub exhausted: bool,
    pub reachable: bool,
}

/// What happened to one call during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Sent; payload deleted.
    Delivered,
    /// Rejected or unrecoverable; payload deleted, not retried.
    Dropped,
    /// Returned to its endpoint FIFO; payload kept.
    Requeued,
}

/// Counters of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub delivered: usize,
    pub dropped: usize,
    pub requeued: usize,
    pub rate_limited: usize,
    pub transient_failures: usize,
}

struct SchedulerState {
    phase: SchedulerPhase,
    handle: Option<Box<dyn CancellableHandle>>,
    generation: u64,
    next_backoff: Duration,
    reachable: bool,
    exhausted: bool,
}

struct SchedulerInner {
    queue: Arc<PendingCallQueue>,
    payloads: Arc<CacheRegistry>,
    limiter: Arc<RateLimiter>,
    sender: Arc<dyn Sender>,
    timers: Arc<dyn Worker>,
    network: Arc<dyn Worker>,
    policy: RetryPolicy,
    state: Mutex<SchedulerState>,
}

/// Drives delivery of the pending-call queue.
pub struct RetryScheduler {
    inner: Arc<SchedulerInner>,
}

impl RetryScheduler {
    /// `timers` runs the delayed pass trigger, `network` runs the passes.
    ///
    /// A base period below [`MIN_RETRY_PERIOD`] is raised to it.
    pub fn new(
        queue: Arc<PendingCallQueue>,
        payloads: Arc<CacheRegistry>,
        limiter: Arc<RateLimiter>,
        sender: Arc<dyn Sender>,
        timers: Arc<dyn Worker>,
        network: Arc<dyn Worker>,
        policy: RetryPolicy,
    ) -> Self {
        let policy = RetryPolicy {
            base_retry_period: policy.base_retry_period.max(MIN_RETRY_PERIOD),
            ..policy
        };
        Self {
            inner: Arc::new(SchedulerInner {
                queue,
                payloads,
                limiter,
                sender,
                timers,
                network,
                policy,
                state: Mutex::new(SchedulerState {
                    phase: SchedulerPhase::Idle,
                    handle: None,
                    generation: 0,
                    next_backoff: policy.base_retry_period,
                    reachable: true,
                    exhausted: false,
                }),
            }),
        }
    }

    /// Schedule an immediate pass if idle and something is deliverable.
    pub fn wake(&self) {
        self.inner.wake();
    }

    pub fn on_network_status_change(&self, status: NetworkStatus) {
        if status == NetworkStatus::Reachable {
            let regained = {
                let mut state = self.inner.state.lock();
                let regained = !state.reachable;
                state.reachable = true;
                regained
            };
            if regained {
                info!("Network reachable, resuming delivery");
                self.inner.wake();
            }
        } else {
            let mut state = self.inner.state.lock();
            state.reachable = false;
            if state.phase == SchedulerPhase::Scheduled {
                if let Some(handle) = state.handle.take() {
                    handle.cancel();
                }
                state.generation += 1;
                state.phase = SchedulerPhase::Idle;
                debug!("Network lost, cancelled scheduled pass");
            }
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.inner.state.lock();
        SchedulerStatus {
            phase: state.phase,
            next_backoff: state.next_backoff,
            exhausted: state.exhausted,
            reachable: state.reachable,
        }
    }
}

impl SchedulerInner {
    fn wake(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.phase != SchedulerPhase::Idle || !state.reachable || state.exhausted {
            return;
        }
        if !self.queue.has_deliverable(|e| self.limiter.is_limited(e)) {
            return;
        }
        self.schedule_locked(&mut state, Duration::ZERO);
    }

    fn schedule_locked(self: &Arc<Self>, state: &mut SchedulerState, delay: Duration) {
        state.generation += 1;
        let generation = state.generation;
        let weak = Arc::downgrade(self);

        state.handle = Some(self.timers.schedule_after(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_timer(generation);
                }
            }),
        ));
        state.phase = SchedulerPhase::Scheduled;
        debug!(delay_secs = delay.as_secs(), "Delivery pass scheduled");
    }

    fn on_timer(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.phase != SchedulerPhase::Scheduled {
                debug!("Ignoring superseded delivery timer");
                return;
            }
            state.handle = None;
            if !state.reachable {
                state.phase = SchedulerPhase::Idle;
                return;
            }
            state.phase = SchedulerPhase::Draining;
        }

        let weak = Arc::downgrade(self);
        self.network.submit(
            TaskPriority::High,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.drain();
                }
            }),
        );
    }

    fn drain(self: &Arc<Self>) {
        let mut report = PassReport::default();
        let mut retry: Vec<PendingCall> = Vec::new();

        while let Some(call) = self.queue.poll_next(|e| self.limiter.is_limited(e)) {
            match self.attempt(&call, &mut report) {
                CallOutcome::Delivered => report.delivered += 1,
                CallOutcome::Dropped => report.dropped += 1,
                CallOutcome::Requeued => {
                    report.requeued += 1;
                    retry.push(call);
                }
            }
        }

        for dropped in self.queue.requeue(retry) {
            report.dropped += 1;
            debug!(payload = %dropped.cached_payload_key, "Call dropped on requeue");
        }
        if let Err(e) = self.queue.persist(&self.payloads) {
            warn!(error = %e, "Failed to persist pending calls after pass");
        }

        info!(
            delivered = report.delivered,
            dropped = report.dropped,
            requeued = report.requeued,
            rate_limited = report.rate_limited,
            transient = report.transient_failures,
            "Delivery pass finished"
        );
        self.finish(report.transient_failures > 0);
    }

    fn attempt(self: &Arc<Self>, call: &PendingCall, report: &mut PassReport) -> CallOutcome {
        let key = &call.cached_payload_key;
        let sent = self
            .payloads
            .load(key, |payload| Ok(self.sender.send(&call.request, payload)));

        let outcome = match sent {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                warn!(endpoint = %call.endpoint, payload = %key, "Cached payload missing, dropping call");
                self.discard_payload(key);
                return CallOutcome::Dropped;
            }
            Err(e) => {
                warn!(endpoint = %call.endpoint, payload = %key, error = %e, "Failed to read cached payload");
                report.transient_failures += 1;
                return CallOutcome::Requeued;
            }
        };

        match outcome {
            SendOutcome::Delivered => {
                self.limiter.on_non_limited_response(call.endpoint);
                self.discard_payload(key);
                debug!(endpoint = %call.endpoint, payload = %key, "Call delivered");
                CallOutcome::Delivered
            }
            SendOutcome::Rejected => {
                self.limiter.on_non_limited_response(call.endpoint);
                self.discard_payload(key);
                warn!(endpoint = %call.endpoint, payload = %key, "Call rejected, dropping");
                CallOutcome::Dropped
            }
            SendOutcome::Retryable => {
                self.limiter.on_non_limited_response(call.endpoint);
                report.transient_failures += 1;
                debug!(endpoint = %call.endpoint, payload = %key, "Call failed, will retry");
                CallOutcome::Requeued
            }
            SendOutcome::RateLimited { retry_after } => {
                report.rate_limited += 1;
                self.limiter
                    .on_rate_limit_response(call.endpoint, retry_after, self.wake_task());
                CallOutcome::Requeued
            }
        }
    }

    fn finish(self: &Arc<Self>, had_transient_failures: bool) {
        let mut state = self.state.lock();
        state.phase = SchedulerPhase::Idle;
        if !state.reachable {
            return;
        }

        if had_transient_failures {
            let delay = state.next_backoff;
            if delay > self.policy.max_retry_period {
                state.exhausted = true;
                warn!(
                    delay_secs = delay.as_secs(),
                    max_secs = self.policy.max_retry_period.as_secs(),
                    "Retry backoff exhausted, delivery paused until next start"
                );
                return;
            }
            state.next_backoff = delay.saturating_mul(2);
            self.schedule_locked(&mut state, delay);
        } else {
            state.next_backoff = self.policy.base_retry_period;
            if self.queue.has_deliverable(|e| self.limiter.is_limited(e)) {
                self.schedule_locked(&mut state, Duration::ZERO);
            }
        }
    }

    fn discard_payload(&self, key: &str) {
        if let Err(e) = self.payloads.delete(key) {
            warn!(payload = %key, error = %e, "Failed to delete delivered payload");
        }
    }

    fn wake_task(self: &Arc<Self>) -> Task {
        let weak: Weak<Self> = Arc::downgrade(self);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.wake();
            }
        })
    }
}

/// Persist `queue` and wake `scheduler`; shared by every enqueue path.
pub(crate) fn commit_enqueue(
    queue: &PendingCallQueue,
    payloads: &CacheRegistry,
    scheduler: &RetryScheduler,
    call: PendingCall,
) -> OutboxResult<()> {
    let endpoint = call.endpoint;
    queue.enqueue(call);
    queue.persist(payloads)?;
    debug!(endpoint = %endpoint, "Call enqueued");
    scheduler.wake();
    Ok(())
}
