//! Per-endpoint rate limiting.

use crate::Endpoint;
use background_workers::{CancellableHandle, Clock, Task, Worker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Cooldown bookkeeping of one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitState {
    pub cooldown_until_ms: i64,
    pub consecutive_retries: u32,
}

#[derive(Default)]
struct Slot {
    state: RateLimitState,
    generation: u64,
    timer: Option<Box<dyn CancellableHandle>>,
}

impl Slot {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// Tracks cooldowns installed by rate-limit responses.
///
/// Independent of the queue: callers ask [`RateLimiter::is_limited`] and
/// report every response through one of the `on_*` methods.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    timers: Arc<dyn Worker>,
    backoff_base: u32,
    slots: Arc<Mutex<HashMap<Endpoint, Slot>>>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>, timers: Arc<dyn Worker>, backoff_base: u32) -> Self {
        Self {
            clock,
            timers,
            backoff_base: backoff_base.max(1),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_limited(&self, endpoint: Endpoint) -> bool {
        let now = self.clock.now_ms();
        self.slots
            .lock()
            .get(&endpoint)
            .map_or(false, |slot| now < slot.state.cooldown_until_ms)
    }

    pub fn state(&self, endpoint: Endpoint) -> Option<RateLimitState> {
        self.slots.lock().get(&endpoint).map(|slot| slot.state)
    }

    /// Install a cooldown for `endpoint` and run `on_elapsed` when it ends.
    ///
    /// The delay is `retry_after` when the server sent one, otherwise
    /// `base^consecutive_retries` seconds. Replaces any earlier cooldown
    /// timer of the endpoint. Returns the delay.
    pub fn on_rate_limit_response(
        &self,
        endpoint: Endpoint,
        retry_after: Option<Duration>,
        on_elapsed: Task,
    ) -> Duration {
        let mut slots = self.slots.lock();
        let slot = slots.entry(endpoint).or_default();

        let delay = retry_after.unwrap_or_else(|| {
            Duration::from_secs(
                u64::from(self.backoff_base).saturating_pow(slot.state.consecutive_retries),
            )
        });
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);

        slot.state.cooldown_until_ms = self.clock.now_ms().saturating_add(delay_ms);
        slot.state.consecutive_retries = slot.state.consecutive_retries.saturating_add(1);
        slot.generation += 1;
        slot.cancel_timer();

        let generation = slot.generation;
        let slots_ref = Arc::downgrade(&self.slots);
        let clock = self.clock.clone();
        slot.timer = Some(self.timers.schedule_after(
            delay,
            Box::new(move || {
                let Some(slots) = slots_ref.upgrade() else {
                    return;
                };
                {
                    let mut slots = slots.lock();
                    let Some(slot) = slots.get_mut(&endpoint) else {
                        return;
                    };
                    if slot.generation != generation {
                        return;
                    }
                    // Timers may fire slightly ahead of the wall clock.
                    slot.state.cooldown_until_ms = slot.state.cooldown_until_ms.min(clock.now_ms());
                    slot.timer = None;
                }
                debug!(endpoint = %endpoint, "Rate-limit cooldown elapsed");
                on_elapsed();
            }),
        ));

        info!(
            endpoint = %endpoint,
            delay_secs = delay.as_secs(),
            consecutive = slot.state.consecutive_retries,
            "Endpoint rate limited"
        );
        delay
    }

    /// Clear any cooldown of `endpoint` after a response that was not a rate limit.
    pub fn on_non_limited_response(&self, endpoint: Endpoint) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&endpoint) else {
            return;
        };
        if slot.state == RateLimitState::default() && slot.timer.is_none() {
            return;
        }

        slot.state = RateLimitState::default();
        slot.generation += 1;
        slot.cancel_timer();
        debug!(endpoint = %endpoint, "Rate-limit state reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use background_workers::{FakeClock, ManualWorker};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter() -> (Arc<FakeClock>, Arc<ManualWorker>, RateLimiter) {
        let clock = Arc::new(FakeClock::new(1_000_000));
        let worker = Arc::new(ManualWorker::with_clock(clock.clone()));
        let limiter = RateLimiter::new(clock.clone(), worker.clone(), 3);
        (clock, worker, limiter)
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Task {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn cooldown_grows_by_powers_of_three_without_retry_after() {
        let (_clock, worker, limiter) = limiter();
        let fired = Arc::new(AtomicUsize::new(0));

        let delays: Vec<Duration> = (0..3)
            .map(|_| limiter.on_rate_limit_response(Endpoint::Events, None, counting(&fired)))
            .collect();
        assert_eq!(
            delays,
            vec![Duration::from_secs(1), Duration::from_secs(3), Duration::from_secs(9)]
        );
        assert_eq!(limiter.state(Endpoint::Events).unwrap().consecutive_retries, 3);

        // Only the latest timer is live.
        assert_eq!(worker.pending_delays(), vec![Duration::from_secs(9)]);
    }

    #[test]
    fn retry_after_overrides_backoff_and_elapses() {
        let (_clock, worker, limiter) = limiter();
        let fired = Arc::new(AtomicUsize::new(0));

        let delay = limiter.on_rate_limit_response(
            Endpoint::Logging,
            Some(Duration::from_secs(30)),
            counting(&fired),
        );
        assert_eq!(delay, Duration::from_secs(30));
        assert!(limiter.is_limited(Endpoint::Logging));
        assert!(!limiter.is_limited(Endpoint::Events));

        worker.advance(Duration::from_secs(29));
        assert!(limiter.is_limited(Endpoint::Logging));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        worker.advance(Duration::from_secs(1));
        assert!(!limiter.is_limited(Endpoint::Logging));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_limited_response_resets_and_cancels() {
        let (_clock, worker, limiter) = limiter();
        let fired = Arc::new(AtomicUsize::new(0));

        limiter.on_rate_limit_response(Endpoint::Blobs, None, counting(&fired));
        limiter.on_rate_limit_response(Endpoint::Blobs, None, counting(&fired));
        limiter.on_non_limited_response(Endpoint::Blobs);

        assert!(!limiter.is_limited(Endpoint::Blobs));
        assert_eq!(limiter.state(Endpoint::Blobs), Some(RateLimitState::default()));

        worker.advance(Duration::from_secs(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let delay = limiter.on_rate_limit_response(Endpoint::Blobs, None, counting(&fired));
        assert_eq!(delay, Duration::from_secs(1));
    }

    #[test]
    fn state_is_created_lazily() {
        let (_clock, _worker, limiter) = limiter();
        limiter.on_non_limited_response(Endpoint::Network);
        assert_eq!(limiter.state(Endpoint::Network), None);
        assert!(!limiter.is_limited(Endpoint::Network));
    }
}
