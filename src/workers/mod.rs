//! Slow-path worker pool: consumes CDC, reconstructs conversations, and
//! computes per-event metrics. A dispatcher reads the CDC stream as the
//! `slowpath` consumer group and routes each record by a stable hash of
//! `session_id` to one of `worker_count` tokio tasks — sticky partitioning
//! guarantees within-session ordering even though the group has many
//! members.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use rusqlite::Connection;
use tokio::sync::mpsc;

use crate::cdc::{CdcQueue, CdcRecord};
use crate::config::SlowPathConfig;
use crate::derived_store::{self, ConversationDelta};
use crate::error::EngineError;
use crate::metrics_store::{self, MetricPoint};
use crate::raw_store;
use crate::schema::Event;
use crate::shared_state::{SharedState, COUNTER_ACCEPTANCES, COUNTER_SUCCESSES, COUNTER_TOOL_INVOCATIONS};

const SLOWPATH_GROUP: &str = "slowpath";
const DISPATCH_BATCH: usize = 100;
const DISPATCH_POLL: Duration = Duration::from_millis(10);
const STALE_CLAIM_MIN_IDLE_MS: u64 = 30_000;

/// Stable (non-cryptographic) hash of `session_id` modulo `worker_count` —
/// the routing function sticky partitioning is built on. Deliberately
/// `DefaultHasher`, not a cryptographic hash: only a stable hash is needed
/// here, and this codebase reserves cryptographic hashing for identity
/// concerns it doesn't have.
pub fn owning_worker(session_id: &str, worker_count: usize) -> usize {
    if worker_count == 0 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    session_id.hash(&mut hasher);
    (hasher.finish() % worker_count as u64) as usize
}

/// Derives the per-event conversation delta, the list of metric points a
/// single event contributes, and the `session_aggregates` keys it bumps
/// (e.g. `tool:Read`, `role:user`), as a pure function of the event and its
/// prior conversation state, accumulated into store-backed rows rather than
/// kept in memory.
pub fn derive(session_id: &str, event: &Event) -> (ConversationDelta, Vec<MetricPoint>, Vec<(String, f64)>) {
    let mut delta = ConversationDelta {
        role: "other".to_string(),
        timestamp: event.timestamp,
        ..Default::default()
    };
    let mut points = Vec::new();
    let mut aggregates = Vec::new();

    match event.event_type.as_str() {
        "user_prompt_submit" => {
            delta.role = "user".to_string();
            delta.is_user_message = true;
            let length = event
                .payload
                .get("prompt_length")
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            delta.length_chars = length;
            points.push(MetricPoint {
                category: "prompting".to_string(),
                name: "length".to_string(),
                session_id: Some(session_id.to_string()),
                value: length as f64,
                timestamp: event.timestamp,
            });
            aggregates.push(("role:user".to_string(), 1.0));
        }
        "assistant_message" | "api_usage" => {
            delta.role = "assistant".to_string();
            delta.is_assistant_message = true;
            delta.tokens_in = event.payload.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
            delta.tokens_out = event.payload.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
            if delta.tokens_in > 0 {
                points.push(MetricPoint {
                    category: "tokens".to_string(),
                    name: "input".to_string(),
                    session_id: Some(session_id.to_string()),
                    value: delta.tokens_in as f64,
                    timestamp: event.timestamp,
                });
            }
            if delta.tokens_out > 0 {
                points.push(MetricPoint {
                    category: "tokens".to_string(),
                    name: "output".to_string(),
                    session_id: Some(session_id.to_string()),
                    value: delta.tokens_out as f64,
                    timestamp: event.timestamp,
                });
            }
            aggregates.push(("role:assistant".to_string(), 1.0));
        }
        "post_tool_use" => {
            delta.role = "tool".to_string();
            delta.is_tool_invocation = true;
            let tool_name = event
                .payload
                .get("tool_name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            points.push(MetricPoint {
                category: "tools".to_string(),
                name: tool_name.to_lowercase(),
                session_id: Some(session_id.to_string()),
                value: 1.0,
                timestamp: event.timestamp,
            });
            aggregates.push((format!("tool:{tool_name}"), 1.0));
            delta.tool_name = Some(tool_name);
        }
        _ => {
            // Unknown event types are stored losslessly upstream but
            // contribute no counters, metrics, or aggregates here.
        }
    }

    (delta, points, aggregates)
}

/// Processes one CDC-driven record end to end: read blob, decompress,
/// idempotence check, advance conversation state, derive metrics, record
/// them, all within the bounds of one session's sticky-partitioned worker.
/// Returns `Ok(true)` if the record was applied, `Ok(false)` if it was a
/// no-op because it had already been processed.
pub fn process_record(
    raw_conn: &Connection,
    derived_conn: &mut Connection,
    metrics_conn: &mut Connection,
    shared: &SharedState,
    record: &CdcRecord,
) -> Result<bool, EngineError> {
    if let Some(existing) = derived_store::get_conversation(derived_conn, &record.session_id)? {
        if record.raw_row_id <= existing.last_processed_row_id {
            return Ok(false);
        }
    }

    let blob = raw_store::get_blob(raw_conn, record.platform, record.raw_row_id)?
        .ok_or_else(|| {
            EngineError::DerivationError(format!(
                "raw row {} missing for session {} (trimmed?)",
                record.raw_row_id, record.session_id
            ))
        })?;
    let event = Event::decode(&blob).map_err(|e| {
        EngineError::DerivationError(format!("failed to decode row {}: {e}", record.raw_row_id))
    })?;

    let (delta, points, aggregates) = derive(&record.session_id, &event);

    derived_store::apply_delta(
        derived_conn,
        &record.session_id,
        record.platform,
        event.workspace_hash(),
        record.raw_row_id,
        &delta,
    )?;

    for (key, value) in &aggregates {
        derived_store::accumulate_aggregate(derived_conn, &record.session_id, key, *value)?;
    }

    if !points.is_empty() {
        metrics_store::record_batch(metrics_conn, &points)?;
    }

    if delta.is_user_message || delta.is_assistant_message {
        shared.incr(COUNTER_SUCCESSES, 1);
    }
    if delta.is_user_message {
        shared.incr(COUNTER_ACCEPTANCES, 1);
    }
    if delta.is_tool_invocation {
        shared.incr(COUNTER_TOOL_INVOCATIONS, 1);
    }

    Ok(true)
}

/// Handle to the running slow-path worker pool.
pub struct WorkerPool {
    dispatcher: tokio::task::JoinHandle<()>,
    workers: Vec<tokio::task::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: SlowPathConfig,
        cdc: CdcQueue,
        db_path: std::path::PathBuf,
        shared: Arc<SharedState>,
    ) -> Result<WorkerPool, EngineError> {
        let worker_count = config.worker_count.max(1);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<u64>();

        for idx in 0..worker_count {
            let (tx, rx) = mpsc::channel::<(u64, CdcRecord)>(256);
            senders.push(tx);
            let path = db_path.clone();
            let shared = shared.clone();
            let ack_tx = ack_tx.clone();
            workers.push(tokio::spawn(worker_loop(idx, rx, path, shared, ack_tx)));
        }
        drop(ack_tx);

        let dispatcher_shutdown = shutdown.clone();
        let dispatcher_cdc = cdc.clone();
        let dispatcher = tokio::spawn(async move {
            let consumer = "slowpath-dispatch";
            let mut pending_ack = Vec::new();
            while !dispatcher_shutdown.load(Ordering::SeqCst) {
                let batch = dispatcher_cdc.stream.read_group(SLOWPATH_GROUP, consumer, DISPATCH_BATCH);
                if batch.is_empty() {
                    let claimed = dispatcher_cdc.stream.claim_stale(
                        SLOWPATH_GROUP,
                        consumer,
                        Duration::from_millis(STALE_CLAIM_MIN_IDLE_MS),
                        u32::MAX,
                    );
                    for (stream_id, record) in claimed.redelivered {
                        route(&senders, stream_id, record).await;
                    }
                    tokio::time::sleep(DISPATCH_POLL).await;
                } else {
                    for (stream_id, record) in batch {
                        route(&senders, stream_id, record).await;
                    }
                }

                while let Ok(id) = ack_rx.try_recv() {
                    pending_ack.push(id);
                }
                if !pending_ack.is_empty() {
                    dispatcher_cdc.stream.ack(SLOWPATH_GROUP, &pending_ack);
                    pending_ack.clear();
                }
            }
        });

        Ok(WorkerPool {
            dispatcher,
            workers,
            shutdown,
        })
    }

    /// Signals the dispatcher and all workers to stop once their current
    /// in-flight record finishes, then waits for them to exit.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.dispatcher.await;
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn route(senders: &[mpsc::Sender<(u64, CdcRecord)>], stream_id: u64, record: CdcRecord) {
    let idx = owning_worker(&record.session_id, senders.len());
    // A full channel means that worker is behind; waiting here is the
    // correct backpressure response rather than dropping the record.
    let _ = senders[idx].send((stream_id, record)).await;
}

async fn worker_loop(
    idx: usize,
    mut rx: mpsc::Receiver<(u64, CdcRecord)>,
    db_path: std::path::PathBuf,
    shared: Arc<SharedState>,
    ack_tx: mpsc::UnboundedSender<u64>,
) {
    let conns = match tokio::task::spawn_blocking(move || open_worker_connections(&db_path)).await {
        Ok(Ok(conns)) => Arc::new(SyncMutex::new(conns)),
        Ok(Err(e)) => {
            tracing::error!(worker = idx, error = %e, "slow-path worker failed to open stores, exiting");
            return;
        }
        Err(e) => {
            tracing::error!(worker = idx, error = %e, "slow-path worker panicked opening stores");
            return;
        }
    };

    while let Some((stream_id, record)) = rx.recv().await {
        let conns = conns.clone();
        let shared = shared.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conns.lock();
            let WorkerConnections { raw, derived, metrics } = &mut *guard;
            process_record(raw, derived, metrics, &shared, &record)
        })
        .await;

        match result {
            Ok(Ok(_)) => {
                let _ = ack_tx.send(stream_id);
            }
            Ok(Err(e)) if e.is_transient() => {
                tracing::warn!(worker = idx, error = %e, "transient error deriving record, leaving for redelivery");
                // Do not ack: claim_stale will redeliver after the
                // visibility timeout.
            }
            Ok(Err(e)) => {
                tracing::error!(worker = idx, error = %e, "permanent derivation error, acking and continuing");
                let _ = ack_tx.send(stream_id);
            }
            Err(e) => {
                tracing::error!(worker = idx, error = %e, "slow-path worker task panicked processing a record");
            }
        }
    }
}

struct WorkerConnections {
    raw: Connection,
    derived: Connection,
    metrics: Connection,
}

fn open_worker_connections(db_path: &std::path::Path) -> Result<WorkerConnections, EngineError> {
    let raw = raw_store::open(db_path)?;
    let derived = raw_store::open(db_path)?;
    derived_store::init_schema(&derived)?;
    let metrics = raw_store::open(db_path)?;
    metrics_store::init_schema(&metrics)?;
    Ok(WorkerConnections { raw, derived, metrics })
}
