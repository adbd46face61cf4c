//! Durable pending-call queue.
//!
//! One FIFO per endpoint, bounded by [`QueueLimits`]. Overflow drops the
//! oldest call of that endpoint. The whole queue is persisted as one JSON
//! record through the payload registry's named-file primitive.

use crate::{Endpoint, OutboxResult, QueueLimits, RequestDescriptor};
use parking_lot::Mutex;
use payload_cache_registry::{CacheRegistry, WritePriority};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{Read, Write};
use tracing::{debug, info, warn};

/// Name of the persisted queue record.
pub const PENDING_CALLS_FILE: &str = "pending_calls.json";

/// Version of the persisted queue record.
pub const PERSIST_VERSION: u32 = 2;

/// A call waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCall {
    pub request: RequestDescriptor,
    pub cached_payload_key: String,
    pub queue_time_ms: i64,
    pub endpoint: Endpoint,
}

impl PendingCall {
    pub fn new(request: RequestDescriptor, cached_payload_key: String, queue_time_ms: i64) -> Self {
        Self {
            endpoint: request.endpoint(),
            request,
            cached_payload_key,
            queue_time_ms,
        }
    }
}

#[derive(Serialize)]
struct PersistedQueueRef<'a> {
    version: u32,
    queues: BTreeMap<Endpoint, &'a VecDeque<PendingCall>>,
}

/// Call as written by the flat-array format, which did not always record an endpoint.
#[derive(Deserialize)]
struct LegacyCall {
    request: RequestDescriptor,
    cached_payload_key: String,
    queue_time_ms: i64,
    #[serde(default)]
    endpoint: Option<Endpoint>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PersistedQueue {
    Current {
        version: u32,
        queues: BTreeMap<Endpoint, Vec<PendingCall>>,
    },
    Legacy(Vec<LegacyCall>),
}

/// Per-endpoint FIFOs of calls awaiting delivery.
pub struct PendingCallQueue {
    limits: QueueLimits,
    queues: Mutex<HashMap<Endpoint, VecDeque<PendingCall>>>,
    /// Serializes snapshot + write so an older snapshot never overwrites a newer one.
    persist_lock: Mutex<()>,
}

impl PendingCallQueue {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            limits,
            queues: Mutex::new(HashMap::new()),
            persist_lock: Mutex::new(()),
        }
    }

    /// Restore the queue persisted in `registry`.
    ///
    /// A missing record yields an empty queue. An unreadable or malformed
    /// record is logged and skipped.
    pub fn load(registry: &CacheRegistry, limits: QueueLimits) -> Self {
        let queue = Self::new(limits);

        let bytes = match registry.load_named(PENDING_CALLS_FILE, |reader| {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            Ok(bytes)
        }) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return queue,
            Err(e) => {
                warn!(error = %e, "Failed to read pending calls, starting empty");
                return queue;
            }
        };

        match serde_json::from_slice::<PersistedQueue>(&bytes) {
            Ok(PersistedQueue::Current { version, queues }) => {
                if version != PERSIST_VERSION {
                    debug!(version, "Loading pending calls from a different record version");
                }
                for (endpoint, calls) in queues {
                    for mut call in calls {
                        call.endpoint = endpoint;
                        queue.enqueue(call);
                    }
                }
            }
            Ok(PersistedQueue::Legacy(calls)) => {
                info!(count = calls.len(), "Migrating pending calls from flat format");
                for legacy in calls {
                    let endpoint = legacy
                        .endpoint
                        .unwrap_or_else(|| legacy.request.endpoint());
                    queue.enqueue(PendingCall {
                        request: legacy.request,
                        cached_payload_key: legacy.cached_payload_key,
                        queue_time_ms: legacy.queue_time_ms,
                        endpoint,
                    });
                }
            }
            Err(e) => {
                warn!(error = %e, "Pending calls record is malformed, starting empty");
            }
        }

        debug!(pending = queue.len(), "Loaded pending calls");
        queue
    }

    /// Append `call` to its endpoint's FIFO.
    ///
    /// Returns the call dropped to make room, if the FIFO was full.
    pub fn enqueue(&self, call: PendingCall) -> Option<PendingCall> {
        let depth = self.limits.depth(call.endpoint);
        let endpoint = call.endpoint;

        let mut queues = self.queues.lock();
        let fifo = queues.entry(endpoint).or_default();
        fifo.push_back(call);

        let evicted = if fifo.len() > depth {
            fifo.pop_front()
        } else {
            None
        };
        drop(queues);

        if let Some(dropped) = &evicted {
            warn!(
                endpoint = %endpoint,
                payload = %dropped.cached_payload_key,
                "Pending call queue full, dropped oldest call"
            );
        }
        evicted
    }

    /// Put calls from a finished pass back at the front of their FIFOs.
    ///
    /// Calls keep their relative order and go ahead of anything enqueued
    /// since. Overflow is trimmed from the front. Returns the trimmed calls.
    pub fn requeue(&self, calls: Vec<PendingCall>) -> Vec<PendingCall> {
        if calls.is_empty() {
            return Vec::new();
        }

        let mut queues = self.queues.lock();
        let mut touched = Vec::new();
        for call in calls.into_iter().rev() {
            if !touched.contains(&call.endpoint) {
                touched.push(call.endpoint);
            }
            queues.entry(call.endpoint).or_default().push_front(call);
        }

        let mut evicted = Vec::new();
        for endpoint in touched {
            let depth = self.limits.depth(endpoint);
            if let Some(fifo) = queues.get_mut(&endpoint) {
                while fifo.len() > depth {
                    if let Some(dropped) = fifo.pop_front() {
                        evicted.push(dropped);
                    }
                }
            }
        }
        drop(queues);

        for dropped in &evicted {
            warn!(
                endpoint = %dropped.endpoint,
                payload = %dropped.cached_payload_key,
                "Pending call queue full on requeue, dropped oldest call"
            );
        }
        evicted
    }

    /// Pop the next call to deliver.
    ///
    /// Sessions go first unless limited. Otherwise the non-limited endpoint
    /// whose head call is oldest wins.
    pub fn poll_next<L>(&self, is_limited: L) -> Option<PendingCall>
    where
        L: Fn(Endpoint) -> bool,
    {
        let mut queues = self.queues.lock();
        let endpoint = next_endpoint(&queues, &is_limited)?;
        queues.get_mut(&endpoint).and_then(|fifo| fifo.pop_front())
    }

    /// True iff [`PendingCallQueue::poll_next`] would return a call.
    pub fn has_deliverable<L>(&self, is_limited: L) -> bool
    where
        L: Fn(Endpoint) -> bool,
    {
        next_endpoint(&self.queues.lock(), &is_limited).is_some()
    }

    /// Write the current queue through `registry`.
    pub fn persist(&self, registry: &CacheRegistry) -> OutboxResult<()> {
        let _persisting = self.persist_lock.lock();

        let bytes = {
            let queues = self.queues.lock();
            let record = PersistedQueueRef {
                version: PERSIST_VERSION,
                queues: queues
                    .iter()
                    .filter(|(_, fifo)| !fifo.is_empty())
                    .map(|(endpoint, fifo)| (*endpoint, fifo))
                    .collect(),
            };
            serde_json::to_vec(&record)?
        };

        registry.save_named(PENDING_CALLS_FILE, WritePriority::Synchronous, move |w| {
            w.write_all(&bytes)
        })?;
        Ok(())
    }

    pub fn pending_counts(&self) -> BTreeMap<Endpoint, usize> {
        let queues = self.queues.lock();
        Endpoint::ALL
            .iter()
            .map(|endpoint| (*endpoint, queues.get(endpoint).map_or(0, VecDeque::len)))
            .collect()
    }

    /// All pending calls, grouped by endpoint in FIFO order.
    pub fn snapshot(&self) -> Vec<PendingCall> {
        let queues = self.queues.lock();
        Endpoint::ALL
            .iter()
            .filter_map(|endpoint| queues.get(endpoint))
            .flat_map(|fifo| fifo.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queues.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn next_endpoint<L>(queues: &HashMap<Endpoint, VecDeque<PendingCall>>, is_limited: &L) -> Option<Endpoint>
where
    L: Fn(Endpoint) -> bool,
{
    let has_calls = |endpoint: &Endpoint| queues.get(endpoint).map_or(false, |fifo| !fifo.is_empty());

    if has_calls(&Endpoint::Sessions) && !is_limited(Endpoint::Sessions) {
        return Some(Endpoint::Sessions);
    }

    Endpoint::ALL
        .iter()
        .copied()
        .filter(|endpoint| *endpoint != Endpoint::Sessions)
        .filter(|endpoint| !is_limited(*endpoint))
        .filter_map(|endpoint| {
            queues
                .get(&endpoint)
                .and_then(|fifo| fifo.front())
                .map(|head| (head.queue_time_ms, endpoint))
        })
        .min()
        .map(|(_, endpoint)| endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomic_file_store::AtomicFileStore;
    use background_workers::ManualWorker;
    use payload_cache_registry::RegistryConfig;
    use std::sync::Arc;

    fn call(endpoint: &str, key: &str, queue_time_ms: i64) -> PendingCall {
        PendingCall::new(
            RequestDescriptor::post(format!("https://collector.example.com/v1/{endpoint}")),
            key.to_string(),
            queue_time_ms,
        )
    }

    fn never_limited(_: Endpoint) -> bool {
        false
    }

    fn registry(dir: &std::path::Path) -> CacheRegistry {
        let store = Arc::new(AtomicFileStore::open(dir).unwrap());
        CacheRegistry::new(
            store,
            Arc::new(ManualWorker::new()),
            RegistryConfig::new("payload", "json"),
        )
        .unwrap()
    }

    #[test]
    fn sessions_are_polled_first() {
        let queue = PendingCallQueue::new(QueueLimits::default());
        queue.enqueue(call("events", "e1", 1));
        queue.enqueue(call("sessions", "s1", 5));

        assert_eq!(queue.poll_next(never_limited).unwrap().cached_payload_key, "s1");
        assert_eq!(queue.poll_next(never_limited).unwrap().cached_payload_key, "e1");
        assert!(queue.poll_next(never_limited).is_none());
    }

    #[test]
    fn oldest_head_wins_across_other_endpoints() {
        let queue = PendingCallQueue::new(QueueLimits::default());
        queue.enqueue(call("logging", "l1", 2));
        queue.enqueue(call("events", "e1", 1));

        assert_eq!(queue.poll_next(never_limited).unwrap().cached_payload_key, "e1");
        assert_eq!(queue.poll_next(never_limited).unwrap().cached_payload_key, "l1");
    }

    #[test]
    fn limited_endpoints_are_skipped() {
        let queue = PendingCallQueue::new(QueueLimits::default());
        queue.enqueue(call("sessions", "s1", 1));
        queue.enqueue(call("events", "e1", 2));
        queue.enqueue(call("logging", "l1", 3));

        let limited = |e: Endpoint| e == Endpoint::Sessions || e == Endpoint::Events;
        assert!(queue.has_deliverable(limited));
        assert_eq!(queue.poll_next(limited).unwrap().cached_payload_key, "l1");
        assert!(!queue.has_deliverable(limited));
        assert!(queue.poll_next(limited).is_none());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn overflow_drops_the_oldest_call() {
        let queue = PendingCallQueue::new(QueueLimits::uniform(3));
        for i in 0..3 {
            assert!(queue.enqueue(call("blobs", &format!("b{i}"), i)).is_none());
        }
        let dropped = queue.enqueue(call("blobs", "b3", 3)).unwrap();
        assert_eq!(dropped.cached_payload_key, "b0");

        let keys: Vec<String> = queue.snapshot().into_iter().map(|c| c.cached_payload_key).collect();
        assert_eq!(keys, vec!["b1", "b2", "b3"]);
    }

    #[test]
    fn requeue_restores_front_in_original_order() {
        let queue = PendingCallQueue::new(QueueLimits::uniform(3));
        let first = call("events", "e1", 1);
        let second = call("events", "e2", 2);
        queue.enqueue(call("events", "e3", 3));

        let evicted = queue.requeue(vec![first, second]);
        assert!(evicted.is_empty());
        let keys: Vec<String> = queue.snapshot().into_iter().map(|c| c.cached_payload_key).collect();
        assert_eq!(keys, vec!["e1", "e2", "e3"]);

        let evicted = queue.requeue(vec![call("events", "e0", 0)]);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].cached_payload_key, "e0");
    }

    #[test]
    fn persists_and_reloads_per_endpoint_fifos() {
        let temp = tempfile::tempdir().unwrap();
        let registry = registry(temp.path());

        let queue = PendingCallQueue::new(QueueLimits::default());
        queue.enqueue(call("sessions", "s1", 1));
        queue.enqueue(call("events", "e1", 2));
        queue.enqueue(call("events", "e2", 3));
        queue.persist(&registry).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(temp.path().join(PENDING_CALLS_FILE)).unwrap())
                .unwrap();
        assert_eq!(raw["version"], 2);
        assert_eq!(raw["queues"]["events"].as_array().unwrap().len(), 2);

        let reloaded = PendingCallQueue::load(&registry, QueueLimits::default());
        assert_eq!(reloaded.snapshot(), queue.snapshot());
    }

    #[test]
    fn loads_legacy_flat_array() {
        let temp = tempfile::tempdir().unwrap();
        let registry = registry(temp.path());
        let legacy = r#"[
            {"request":{"url":"https://c.example.com/v1/events","method":"POST"},"cached_payload_key":"e1","queue_time_ms":1},
            {"request":{"url":"https://c.example.com/v1/sessions","method":"POST"},"cached_payload_key":"s1","queue_time_ms":2},
            {"request":{"url":"https://c.example.com/v1/events","method":"POST"},"cached_payload_key":"e2","queue_time_ms":3,"endpoint":"events"}
        ]"#;
        std::fs::write(temp.path().join(PENDING_CALLS_FILE), legacy).unwrap();

        let queue = PendingCallQueue::load(&registry, QueueLimits::default());
        let counts = queue.pending_counts();
        assert_eq!(counts[&Endpoint::Events], 2);
        assert_eq!(counts[&Endpoint::Sessions], 1);
        assert_eq!(queue.poll_next(never_limited).unwrap().cached_payload_key, "s1");
        assert_eq!(queue.poll_next(never_limited).unwrap().cached_payload_key, "e1");
    }

    #[test]
    fn malformed_record_starts_empty() {
        let temp = tempfile::tempdir().unwrap();
        let registry = registry(temp.path());
        std::fs::write(temp.path().join(PENDING_CALLS_FILE), "{\"version\":2,").unwrap();

        let queue = PendingCallQueue::load(&registry, QueueLimits::default());
        assert!(queue.is_empty());
    }
}
