//! Outbox for reliable telemetry delivery.
//!
//! This crate provides:
//! - PendingCallQueue: durable per-endpoint FIFOs of calls awaiting delivery
//! - RateLimiter: per-endpoint cooldowns after rate-limit responses
//! - RetryScheduler: drain passes with exponential backoff
//! - DeliveryPipeline: wires cache, queue, limiter and scheduler together

mod endpoint;
mod error;
mod manager;
mod queue;
mod rate_limit;
mod request;
mod scheduler;

pub use endpoint::{Endpoint, QueueLimits};
pub use error::{OutboxError, OutboxResult};
pub use manager::{
    normalize_cache, payload_registry_config, session_registry_config, DeliveryPipeline,
    PipelineWorkers, CACHE_EXTENSION, CRASH_FILE, PAYLOAD_PREFIX, SESSION_PREFIX,
};
pub use queue::{PendingCall, PendingCallQueue, PENDING_CALLS_FILE, PERSIST_VERSION};
pub use rate_limit::{RateLimitState, RateLimiter};
pub use request::{NetworkStatus, RequestDescriptor, SendOutcome, Sender};
pub use scheduler::{
    CallOutcome, PassReport, RetryPolicy, RetryScheduler, SchedulerPhase, SchedulerStatus,
};
