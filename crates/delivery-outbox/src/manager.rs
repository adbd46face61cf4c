//! Delivery pipeline wiring the cache, queue, limiter and scheduler together.

use crate::scheduler::commit_enqueue;
use crate::{
    Endpoint, NetworkStatus, OutboxError, OutboxResult, PendingCall, PendingCallQueue, QueueLimits,
    RateLimiter, RequestDescriptor, RetryPolicy, RetryScheduler, SchedulerStatus, Sender,
};
use atomic_file_store::{AtomicFileStore, NormalizeReport, StoreResult};
use background_workers::{Clock, RuntimeWorker, TaskPriority, Worker};
use delivery_config_and_utils::{DeliveryConfig, Paths};
use payload_cache_registry::{
    generate_payload_key, CacheError, CacheRegistry, CachedEntry, JsonSerializer,
    PayloadSerializer, RegistryConfig, SnapshotType, WritePriority,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prefix of cached session snapshots.
pub const SESSION_PREFIX: &str = "last_session";
/// Prefix of cached request payloads.
pub const PAYLOAD_PREFIX: &str = "payload";
/// Extension of every cache file.
pub const CACHE_EXTENSION: &str = "json";
/// Name of the crash report written while the process dies.
pub const CRASH_FILE: &str = "crash_report.json";

pub fn session_registry_config(config: &DeliveryConfig) -> RegistryConfig {
    RegistryConfig::new(SESSION_PREFIX, CACHE_EXTENSION).with_max_entries(config.max_cached_entries)
}

pub fn payload_registry_config(config: &DeliveryConfig) -> RegistryConfig {
    RegistryConfig::new(PAYLOAD_PREFIX, CACHE_EXTENSION).with_max_entries(config.max_cached_payloads)
}

/// Repair `store` once, migrating the legacy file of every registry in `configs`.
pub fn normalize_cache(
    store: &AtomicFileStore,
    configs: &[&RegistryConfig],
) -> StoreResult<NormalizeReport> {
    store.normalize(|name, modified_ms| {
        configs
            .iter()
            .find_map(|config| config.legacy_rename(name, modified_ms))
    })
}

/// Background workers used by the pipeline.
pub struct PipelineWorkers {
    /// Cache writes and deletes.
    pub io: Arc<dyn Worker>,
    /// Drain passes.
    pub network: Arc<dyn Worker>,
    /// Delayed pass and cooldown timers.
    pub scheduler: Arc<dyn Worker>,
}

impl PipelineWorkers {
    /// Start one dedicated runtime worker per role.
    pub fn spawn() -> OutboxResult<Self> {
        Ok(Self {
            io: Arc::new(RuntimeWorker::new("delivery-io")?),
            network: Arc::new(RuntimeWorker::new("delivery-network")?),
            scheduler: Arc::new(RuntimeWorker::new("delivery-scheduler")?),
        })
    }

    /// Use one worker for every role.
    pub fn shared(worker: Arc<dyn Worker>) -> Self {
        Self {
            io: worker.clone(),
            network: worker.clone(),
            scheduler: worker,
        }
    }
}

/// Persistent delivery pipeline.
///
/// `enqueue` stores the payload, records the call and wakes the scheduler,
/// all on the I/O worker, so producers never block on disk.
pub struct DeliveryPipeline {
    io: Arc<dyn Worker>,
    sessions: Arc<CacheRegistry>,
    payloads: Arc<CacheRegistry>,
    queue: Arc<PendingCallQueue>,
    limiter: Arc<RateLimiter>,
    scheduler: Arc<RetryScheduler>,
    clock: Arc<dyn Clock>,
    serializer: JsonSerializer,
}

impl DeliveryPipeline {
    /// Open the cache under `paths`, restore pending calls and start delivering.
    pub fn open(
        config: &DeliveryConfig,
        paths: &Paths,
        sender: Arc<dyn Sender>,
        clock: Arc<dyn Clock>,
        workers: PipelineWorkers,
    ) -> OutboxResult<Self> {
        config.validate()?;
        let store = Arc::new(AtomicFileStore::open(paths.cache_dir())?);

        let session_config = session_registry_config(config);
        let payload_config = payload_registry_config(config);
        let report = normalize_cache(&store, &[&session_config, &payload_config])?;
        if !report.is_clean() {
            info!(?report, "Recovered cache after unclean shutdown");
        }

        let sessions = Arc::new(CacheRegistry::new(
            store.clone(),
            workers.io.clone(),
            session_config,
        )?);
        let payloads = Arc::new(CacheRegistry::new(
            store,
            workers.io.clone(),
            payload_config,
        )?);

        let queue = Arc::new(PendingCallQueue::load(
            &payloads,
            QueueLimits::from(config.queue_depths),
        ));
        let limiter = Arc::new(RateLimiter::new(
            clock.clone(),
            workers.scheduler.clone(),
            config.rate_limit_backoff_base,
        ));
        let scheduler = Arc::new(RetryScheduler::new(
            queue.clone(),
            payloads.clone(),
            limiter.clone(),
            sender,
            workers.scheduler,
            workers.network,
            RetryPolicy {
                base_retry_period: config.base_retry_period(),
                max_retry_period: config.max_retry_period(),
            },
        ));

        info!(
            cache_dir = %paths.cache_dir().display(),
            pending = queue.len(),
            "Delivery pipeline opened"
        );

        let pipeline = Self {
            io: workers.io,
            sessions,
            payloads,
            queue,
            limiter,
            scheduler,
            clock,
            serializer: JsonSerializer::default(),
        };
        pipeline.scheduler.wake();
        Ok(pipeline)
    }

    /// Queue `request` for delivery with the body produced by `payload`.
    ///
    /// Returns the key the payload is cached under. Failures past this point
    /// are logged on the I/O worker.
    pub fn enqueue<F>(&self, request: RequestDescriptor, payload: F) -> String
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()> + Send + 'static,
    {
        let key = generate_payload_key();
        let queue_time_ms = self.clock.now_ms();
        let call = PendingCall::new(request, key.clone(), queue_time_ms);

        let payloads = self.payloads.clone();
        let queue = self.queue.clone();
        let scheduler = self.scheduler.clone();
        self.io.submit(
            TaskPriority::High,
            Box::new(move || {
                let key = call.cached_payload_key.clone();
                let endpoint = call.endpoint;
                let stored = payloads
                    .save(&key, queue_time_ms, WritePriority::Synchronous, payload)
                    .map_err(OutboxError::from)
                    .and_then(|()| commit_enqueue(&queue, &payloads, &scheduler, call));
                if let Err(e) = stored {
                    warn!(endpoint = %endpoint, payload = %key, error = %e, "Failed to enqueue call");
                }
            }),
        );
        key
    }

    pub fn enqueue_bytes(&self, request: RequestDescriptor, payload: Vec<u8>) -> String {
        self.enqueue(request, move |w| w.write_all(&payload))
    }

    pub fn on_network_status_change(&self, status: NetworkStatus) {
        self.scheduler.on_network_status_change(status);
    }

    /// Ask for a delivery pass now, if one is possible.
    pub fn wake(&self) {
        self.scheduler.wake();
    }

    pub fn status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    pub fn pending_counts(&self) -> BTreeMap<Endpoint, usize> {
        self.queue.pending_counts()
    }

    pub fn pending_calls(&self) -> Vec<PendingCall> {
        self.queue.snapshot()
    }

    pub fn is_rate_limited(&self, endpoint: Endpoint) -> bool {
        self.limiter.is_limited(endpoint)
    }

    pub fn save_session<T: Serialize>(
        &self,
        session_id: &str,
        snapshot_type: SnapshotType,
        snapshot: &T,
    ) -> OutboxResult<()> {
        self.sessions.save_value(
            &self.serializer,
            session_id,
            self.clock.now_ms(),
            snapshot_type.write_priority(),
            snapshot,
        )?;
        debug!(session_id = %session_id, ?snapshot_type, "Session snapshot saved");
        Ok(())
    }

    /// Load a session snapshot. A corrupt snapshot is logged and reported as absent.
    pub fn load_session<T: DeserializeOwned>(&self, session_id: &str) -> OutboxResult<Option<T>> {
        match self.sessions.load_value(&self.serializer, session_id) {
            Ok(snapshot) => Ok(snapshot),
            Err(CacheError::Serialization(e)) => {
                warn!(session_id = %session_id, error = %e, "Skipping corrupt session snapshot");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_session(&self, session_id: &str) -> OutboxResult<bool> {
        Ok(self.sessions.delete(session_id)?)
    }

    /// Cached session snapshots, oldest first.
    pub fn list_sessions(&self) -> OutboxResult<Vec<CachedEntry>> {
        Ok(self.sessions.list_all()?)
    }

    /// Write the crash report on the caller's thread.
    pub fn save_crash<T: Serialize>(&self, report: &T) -> OutboxResult<()> {
        let bytes = self.serializer.encode(report)?;
        self.sessions
            .save_named(CRASH_FILE, WritePriority::Synchronous, move |w| w.write_all(&bytes))?;
        info!("Crash report saved");
        Ok(())
    }

    pub fn load_crash<T: DeserializeOwned>(&self) -> OutboxResult<Option<T>> {
        let bytes = self.sessions.load_named(CRASH_FILE, |reader| {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            Ok(bytes)
        })?;

        match bytes {
            Some(bytes) => match self.serializer.decode(&bytes) {
                Ok(report) => Ok(Some(report)),
                Err(e) => {
                    warn!(error = %e, "Skipping corrupt crash report");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn delete_crash(&self) -> OutboxResult<bool> {
        Ok(self.sessions.delete_named(CRASH_FILE)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_configs_follow_delivery_config() {
        let mut config = DeliveryConfig::default();
        config.max_cached_entries = 10;
        config.max_cached_payloads = 20;

        let sessions = session_registry_config(&config);
        assert_eq!(sessions.prefix, SESSION_PREFIX);
        assert_eq!(sessions.max_entries, 10);
        assert_eq!(payload_registry_config(&config).max_entries, 20);
    }

    #[test]
    fn normalize_cache_migrates_every_legacy_file() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("last_session.json"), "{}").unwrap();
        std::fs::write(temp.path().join("payload.json"), "{}").unwrap();
        std::fs::write(temp.path().join("payload.5.k.json-tmp"), "partial").unwrap();

        let store = AtomicFileStore::open(temp.path()).unwrap();
        let config = DeliveryConfig::default();
        let report = normalize_cache(
            &store,
            &[&session_registry_config(&config), &payload_registry_config(&config)],
        )
        .unwrap();

        assert_eq!(report.migrated_legacy, 2);
        assert_eq!(report.discarded_tmp, 1);
        let keys = store.list_keys(|_| true).unwrap();
        assert!(keys.iter().all(|k| k.contains(".legacy.")));
    }
}
