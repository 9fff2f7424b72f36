//! Supervisor: dependency-ordered startup, health reporting, graceful
//! shutdown, and operator-invoked DLQ replay.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cdc::CdcQueue;
use crate::config::Config;
use crate::error::EngineError;
use crate::ingest::Ingestor;
use crate::queue::{DlqEntry, Stream};
use crate::raw_store;
use crate::schema::Event;
use crate::shared_state::{self, SharedState};
use crate::workers::WorkerPool;

/// Liveness threshold: a worker whose heartbeat is older than this is
/// considered dead.
const LIVENESS_MAX_AGE: Duration = Duration::from_secs(10);

/// Shared, atomically-updated timestamp a component touches on every loop
/// iteration so the supervisor can answer liveness queries without
/// blocking on the component itself.
#[derive(Clone)]
pub struct Heartbeat(Arc<AtomicI64>);

impl Heartbeat {
    pub fn new() -> Self {
        let hb = Heartbeat(Arc::new(AtomicI64::new(0)));
        hb.touch();
        hb
    }

    pub fn touch(&self) {
        self.0.store(now_millis(), Ordering::Relaxed);
    }

    fn age(&self) -> Duration {
        let last = self.0.load(Ordering::Relaxed);
        let delta_ms = (now_millis() - last).max(0);
        Duration::from_millis(delta_ms as u64)
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Result of a health check, exposed both as a Rust API and over
/// `GET /healthz` / `GET /readyz`.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub live: bool,
    pub ready: bool,
    pub queue_reachable: bool,
    pub raw_store_reachable: bool,
    pub events_pending_fastpath: usize,
    pub events_pending_slowpath: usize,
    pub dlq_depth: usize,
}

/// Owns every long-running component and the shared queue streams. Started
/// in dependency order (raw store, queue, CDC, ingestor, worker pool,
/// composite updater); shut down in reverse with a five-step drain.
pub struct Supervisor {
    pub config: Config,
    pub events: Arc<Stream<Vec<u8>>>,
    pub dlq: Arc<Stream<DlqEntry>>,
    pub cdc: CdcQueue,
    pub shared_state: Arc<SharedState>,
    pub reads: raw_store::ReadPool,

    ingestor: Option<Ingestor>,
    worker_pool: Option<WorkerPool>,
    composite_handle: Option<tokio::task::JoinHandle<()>>,
    retention_handle: Option<tokio::task::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    ingest_heartbeat: Heartbeat,
}

impl Supervisor {
    /// Starts every component in dependency order: raw-store schema first
    /// (so the ingestor never races table creation), then the queue
    /// streams (already in-process, nothing to "start"), then the
    /// fast-path ingestor, then the slow-path worker pool, then the
    /// composite updater.
    pub fn start(config: Config) -> Result<Supervisor, EngineError> {
        std::fs::create_dir_all(&config.data_dir)?;

        let db_path = config.db_path();
        let conn = raw_store::open(&db_path)?;
        raw_store::init_schema(&conn)?;
        crate::derived_store::init_schema(&conn)?;
        crate::metrics_store::init_schema(&conn)?;
        drop(conn);

        let reads = raw_store::ReadPool::open(&db_path)?;

        let events: Arc<Stream<Vec<u8>>> = Arc::new(Stream::new(config.queue.max_length));
        let dlq: Arc<Stream<DlqEntry>> = Arc::new(Stream::new(config.queue.max_length * 10));
        let cdc = CdcQueue::with_maxlen(crate::cdc::DEFAULT_CDC_MAXLEN);
        let shared_state = SharedState::new();
        let shutdown = Arc::new(AtomicBool::new(false));

        let ingest_heartbeat = Heartbeat::new();
        let ingestor = Ingestor::spawn(
            db_path.clone(),
            events.clone(),
            dlq.clone(),
            cdc.clone(),
            config.ingest.clone(),
            ingest_heartbeat.clone(),
        );

        let worker_pool = WorkerPool::spawn(config.slow_path.clone(), cdc.clone(), db_path.clone(), shared_state.clone())?;

        let metrics_conn = Arc::new(Mutex::new(raw_store::open(&db_path)?));
        let composite_handle = shared_state::spawn_composite_updater(
            shared_state.clone(),
            metrics_conn.clone(),
            config.composite.clone(),
            "composite-updater-0".to_string(),
            shutdown.clone(),
        );
        let retention_conn = Arc::new(Mutex::new(raw_store::open(&db_path)?));
        let retention_handle = crate::metrics_store::spawn_retention_sweeper(
            retention_conn,
            config.retention.clone(),
            shutdown.clone(),
        );

        tracing::info!(
            data_dir = %config.data_dir.display(),
            worker_count = config.slow_path.worker_count,
            "supervisor: all components started"
        );

        Ok(Supervisor {
            config,
            events,
            dlq,
            cdc,
            shared_state,
            reads,
            ingestor: Some(ingestor),
            worker_pool: Some(worker_pool),
            composite_handle: Some(composite_handle),
            retention_handle: Some(retention_handle),
            shutdown,
            ingest_heartbeat,
        })
    }

    /// Appends one validated-at-the-edge entry to the `events` stream. The
    /// fast-path ingestor performs the real schema validation; this is the
    /// single entry point both the HTTP intake and any in-process capture
    /// code use.
    pub fn submit_event(&self, event: &Event) -> Result<u64, EngineError> {
        let wire = event.to_wire()?;
        Ok(self.events.append(wire))
    }

    pub fn health(&self) -> HealthReport {
        let live = self.ingest_heartbeat.age() <= LIVENESS_MAX_AGE;
        let raw_store_reachable = self.reads.get().is_ok();
        let queue_reachable = true; // in-process, always reachable unless the process is gone
        HealthReport {
            live,
            ready: live && queue_reachable && raw_store_reachable,
            queue_reachable,
            raw_store_reachable,
            events_pending_fastpath: self.events.pending_count("fastpath"),
            events_pending_slowpath: self.cdc.stream.pending_count("slowpath"),
            dlq_depth: self.dlq.len(),
        }
    }

    /// Operator action: re-appends DLQ entries matching `filter` to
    /// `events` with `retry_count` reset, returning how many were replayed.
    pub fn replay_dlq(&self, filter: DlqReplayFilter) -> Result<usize, EngineError> {
        let mut replayed = 0;
        let entries = self.dlq.read_group("dlq-replay", "operator", usize::MAX);
        let mut ids = Vec::new();
        for (stream_id, entry) in entries {
            if !filter.matches(&entry) {
                continue;
            }
            if let Ok(mut event) = Event::from_wire(&entry.payload) {
                event.retry_count = 0;
                if let Ok(wire) = event.to_wire() {
                    self.events.append(wire);
                    replayed += 1;
                    ids.push(stream_id);
                }
            }
        }
        self.dlq.ack("dlq-replay", &ids);
        Ok(replayed)
    }

    /// Five-step graceful shutdown: stop reading new entries, drain
    /// in-flight batches, ack-or-reclaim, flush stores, exit.
    pub async fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(ingestor) = self.ingestor.take() {
            ingestor.shutdown();
        }
        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown().await;
        }
        if let Some(handle) = self.composite_handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
        if let Some(handle) = self.retention_handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }

        tracing::info!("supervisor: shutdown complete");
    }
}

/// Which DLQ entries `replay_dlq` re-enqueues. An empty filter matches
/// everything.
#[derive(Debug, Clone, Default)]
pub struct DlqReplayFilter {
    pub reason_contains: Option<String>,
    pub platform: Option<HashSet<String>>,
}

impl DlqReplayFilter {
    fn matches(&self, entry: &DlqEntry) -> bool {
        if let Some(substr) = &self.reason_contains {
            if !entry.reason.contains(substr.as_str()) {
                return false;
            }
        }
        if let Some(platforms) = &self.platform {
            match &entry.platform_hint {
                Some(p) if platforms.contains(p) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Last measured instant the supervisor itself was constructed; exposed so
/// tests/tools can sanity-check process uptime without a dependency on the
/// wall clock being monotonic.
pub fn process_started_at() -> Instant {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    *START.get_or_init(Instant::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_age_resets_on_touch() {
        let hb = Heartbeat::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(hb.age() >= Duration::from_millis(20));
        hb.touch();
        assert!(hb.age() < Duration::from_millis(20));
    }

    #[test]
    fn dlq_replay_filter_matches_everything_by_default() {
        let filter = DlqReplayFilter::default();
        let entry = DlqEntry {
            original_stream_id: 1,
            payload: vec![],
            reason: "schema invalid".to_string(),
            platform_hint: Some("claude".to_string()),
        };
        assert!(filter.matches(&entry));
    }

    #[test]
    fn dlq_replay_filter_matches_on_reason_substring() {
        let filter = DlqReplayFilter {
            reason_contains: Some("oversize".to_string()),
            platform: None,
        };
        let entry = DlqEntry {
            original_stream_id: 1,
            payload: vec![],
            reason: "payload too large: 2000000 bytes".to_string(),
            platform_hint: None,
        };
        assert!(!filter.matches(&entry));
    }
}
