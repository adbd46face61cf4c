//! delivery-inspect - Look into a telemetry delivery cache without sending anything.

use std::path::PathBuf;
use std::sync::Arc;

use atomic_file_store::{AtomicFileStore, NormalizeReport};
use background_workers::ManualWorker;
use clap::{Parser, Subcommand};
use delivery_config_and_utils::{init_logging_for_service, DeliveryConfig, Paths};
use delivery_outbox::{
    normalize_cache, payload_registry_config, session_registry_config, Endpoint,
    PendingCallQueue, QueueLimits,
};
use payload_cache_registry::{CacheRegistry, CachedEntry};
use tracing::debug;

/// Offline inspector for the delivery cache.
#[derive(Parser)]
#[command(name = "delivery-inspect")]
#[command(about = "Inspect cached sessions, payloads and pending calls")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory of the SDK files. Defaults to the platform data directory
    #[arg(long, global = true, env = "TELEMETRY_BASE_DIR")]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Repair interrupted writes and migrate legacy files
    Normalize,
    /// List cached session snapshots, oldest first
    Sessions,
    /// List cached request payloads, oldest first
    Payloads,
    /// Show calls waiting for delivery
    Pending {
        /// Print the calls as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Cache opened without any background delivery.
struct OfflineCache {
    report: NormalizeReport,
    sessions: CacheRegistry,
    payloads: CacheRegistry,
}

impl OfflineCache {
    fn open(config: &DeliveryConfig, paths: &Paths) -> Result<Self, Box<dyn std::error::Error>> {
        let store = Arc::new(AtomicFileStore::open(paths.cache_dir())?);
        let session_config = session_registry_config(config);
        let payload_config = payload_registry_config(config);
        let report = normalize_cache(&store, &[&session_config, &payload_config])?;

        // Deletes of stale duplicates run inline.
        let io = Arc::new(ManualWorker::new());
        let sessions = CacheRegistry::new(store.clone(), io.clone(), session_config)?;
        let payloads = CacheRegistry::new(store, io, payload_config)?;

        Ok(Self {
            report,
            sessions,
            payloads,
        })
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let mut config = DeliveryConfig::load(&paths)?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    paths.ensure_dirs()?;
    init_logging_for_service("delivery-inspect", &config, &paths, true);
    debug!(base_dir = %paths.base_dir().display(), "Opening delivery cache");

    let cache = OfflineCache::open(&config, &paths)?;

    match cli.command {
        Commands::Normalize => print_report(&cache.report),
        Commands::Sessions => print_entries(&cache.sessions.list_all()?),
        Commands::Payloads => print_entries(&cache.payloads.list_all()?),
        Commands::Pending { json } => {
            let queue =
                PendingCallQueue::load(&cache.payloads, QueueLimits::from(config.queue_depths));
            if json {
                println!("{}", serde_json::to_string_pretty(&queue.snapshot())?);
            } else {
                print_pending(&queue, &cache.payloads)?;
            }
        }
    }

    Ok(())
}

fn print_report(report: &NormalizeReport) {
    if report.is_clean() {
        println!("Cache is clean");
        return;
    }
    println!("Discarded temp files:   {}", report.discarded_tmp);
    println!("Discarded old files:    {}", report.discarded_old);
    println!("Completed swaps:        {}", report.completed_swaps);
    println!("Migrated legacy files:  {}", report.migrated_legacy);
}

fn print_entries(entries: &[CachedEntry]) {
    if entries.is_empty() {
        println!("No cached entries");
        return;
    }
    for entry in entries {
        let version = entry
            .schema_version
            .map(|v| format!("v{v}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>15}  {:<34} {:>4}  {}",
            entry.timestamp_ms, entry.key, version, entry.filename
        );
    }
    println!("{} entries", entries.len());
}

fn print_pending(
    queue: &PendingCallQueue,
    payloads: &CacheRegistry,
) -> Result<(), Box<dyn std::error::Error>> {
    let counts = queue.pending_counts();
    for endpoint in Endpoint::ALL {
        println!("{:<10} {}", endpoint.as_str(), counts.get(&endpoint).copied().unwrap_or(0));
    }

    let calls = queue.snapshot();
    if calls.is_empty() {
        return Ok(());
    }
    println!();
    for call in &calls {
        let cached = payloads.load(&call.cached_payload_key, |_| Ok(()))?.is_some();
        println!(
            "{:>15}  {:<10} {:<34} {:<8} {}",
            call.queue_time_ms,
            call.endpoint.as_str(),
            call.cached_payload_key,
            if cached { "cached" } else { "missing" },
            call.request.url
        );
    }
    Ok(())
}
