//! Fast-path ingestor: dequeue → decode → compress → batch write →
//! emit CDC. Runs on a dedicated OS thread — not a tokio blocking task —
//! since this thread does nothing but call blocking `rusqlite` APIs in a
//! loop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cdc::{CdcQueue, CdcRecord};
use crate::config::IngestConfig;
use crate::error::EngineError;
use crate::queue::{DlqEntry, Stream};
use crate::raw_store::{self, InsertOutcome};
use crate::schema::Event;
use crate::supervisor::Heartbeat;

const FASTPATH_GROUP: &str = "fastpath";
const FASTPATH_CONSUMER: &str = "fastpath-0";
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Rolling latency accounting for the high-water-mark backpressure rule:
/// if p95 transaction latency over the last 30 s exceeds
/// `high_watermark_ms`, the ingestor halves its effective batch size until
/// it recovers.
struct LatencyWindow {
    samples: Mutex<Vec<(Instant, Duration)>>,
}

impl LatencyWindow {
    fn new() -> Self {
        LatencyWindow {
            samples: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, duration: Duration) {
        let mut samples = self.samples.lock();
        samples.push((Instant::now(), duration));
        let cutoff = Instant::now() - Duration::from_secs(30);
        samples.retain(|(at, _)| *at >= cutoff);
    }

    fn p95_ms(&self) -> Option<u64> {
        let mut samples = self.samples.lock();
        let cutoff = Instant::now() - Duration::from_secs(30);
        samples.retain(|(at, _)| *at >= cutoff);
        if samples.is_empty() {
            return None;
        }
        let mut durations: Vec<u64> = samples.iter().map(|(_, d)| d.as_millis() as u64).collect();
        durations.sort_unstable();
        let idx = ((durations.len() as f64) * 0.95).ceil() as usize;
        let idx = idx.saturating_sub(1).min(durations.len() - 1);
        Some(durations[idx])
    }
}

/// Metrics the ingestor exposes to the supervisor for health reporting.
#[derive(Default)]
pub struct IngestMetrics {
    pub rows_inserted: AtomicUsize,
    pub rows_duplicate: AtomicUsize,
    pub dlq_routed: AtomicUsize,
    pub current_batch_size: AtomicUsize,
}

pub struct Ingestor {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    pub metrics: Arc<IngestMetrics>,
}

impl Ingestor {
    /// Spawns the dedicated writer thread. `events` and `dlq` are the
    /// shared queue streams; `cdc` is the fan-out this ingestor publishes
    /// to after every committed transaction.
    pub fn spawn(
        db_path: PathBuf,
        events: Arc<Stream<Vec<u8>>>,
        dlq: Arc<Stream<DlqEntry>>,
        cdc: CdcQueue,
        config: IngestConfig,
        heartbeat: Heartbeat,
    ) -> Ingestor {
        let shutdown = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(IngestMetrics::default());
        metrics
            .current_batch_size
            .store(config.batch_size, Ordering::Relaxed);

        let thread_shutdown = shutdown.clone();
        let thread_metrics = metrics.clone();
        let handle = thread::Builder::new()
            .name("ingest-writer".to_string())
            .spawn(move || {
                run_writer_loop(db_path, events, dlq, cdc, config, thread_shutdown, thread_metrics, heartbeat);
            })
            .expect("failed to spawn ingest-writer thread");

        Ingestor {
            handle: Some(handle),
            shutdown,
            metrics,
        }
    }

    /// Signals the writer loop to stop after its current batch and blocks
    /// until it exits.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_writer_loop(
    db_path: PathBuf,
    events: Arc<Stream<Vec<u8>>>,
    dlq: Arc<Stream<DlqEntry>>,
    cdc: CdcQueue,
    config: IngestConfig,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<IngestMetrics>,
    heartbeat: Heartbeat,
) {
    let mut conn = match raw_store::open(&db_path) {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(error = %e, "ingest-writer failed to open raw store, exiting");
            return;
        }
    };
    if let Err(e) = raw_store::init_schema(&conn) {
        tracing::error!(error = %e, "ingest-writer failed to init schema, exiting");
        return;
    }

    let latency = LatencyWindow::new();
    let mut effective_batch_size = config.batch_size;
    let timeout = Duration::from_millis(config.batch_timeout_ms);
    let high_watermark = Duration::from_millis(config.high_watermark_ms);

    while !shutdown.load(Ordering::SeqCst) {
        heartbeat.touch();
        let batch = collect_batch(&events, effective_batch_size, timeout, &shutdown);
        if batch.is_empty() {
            continue;
        }
        let started = Instant::now();
        process_batch(&mut conn, &events, &dlq, &cdc, batch, &metrics);
        latency.record(started.elapsed());

        if let Some(p95) = latency.p95_ms() {
            if Duration::from_millis(p95) > high_watermark {
                effective_batch_size = (effective_batch_size / 2).max(1);
                tracing::warn!(p95_ms = p95, new_batch_size = effective_batch_size, "fast-path backpressure: halving batch size");
            } else if effective_batch_size < config.batch_size {
                effective_batch_size = (effective_batch_size * 2).min(config.batch_size);
            }
        }
        metrics
            .current_batch_size
            .store(effective_batch_size, Ordering::Relaxed);
    }
}

/// Collects up to `batch_size` entries or waits up to `timeout` — the
/// boundary case of zero events appended within the window returns an
/// empty batch.
fn collect_batch(
    events: &Stream<Vec<u8>>,
    batch_size: usize,
    timeout: Duration,
    shutdown: &AtomicBool,
) -> Vec<(u64, Vec<u8>)> {
    let deadline = Instant::now() + timeout;
    let mut batch = Vec::new();
    loop {
        let remaining = batch_size.saturating_sub(batch.len());
        if remaining > 0 {
            let got = events.read_group(FASTPATH_GROUP, FASTPATH_CONSUMER, remaining);
            batch.extend(got);
        }
        if batch.len() >= batch_size || Instant::now() >= deadline || shutdown.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    batch
}

fn process_batch(
    conn: &mut rusqlite::Connection,
    events: &Stream<Vec<u8>>,
    dlq: &Stream<DlqEntry>,
    cdc: &CdcQueue,
    batch: Vec<(u64, Vec<u8>)>,
    metrics: &IngestMetrics,
) {
    // Step 1: decode + validate. Invalid entries go straight to DLQ, never
    // retried.
    let mut valid: Vec<(u64, Event)> = Vec::with_capacity(batch.len());
    let mut ack_ids: Vec<u64> = Vec::with_capacity(batch.len());
    for (stream_id, wire) in batch {
        ack_ids.push(stream_id);
        match Event::from_wire(&wire).and_then(|event| event.validate().map(|_| event)) {
            Ok(event) => valid.push((stream_id, event)),
            Err(e) => {
                dlq.append(DlqEntry {
                    original_stream_id: stream_id,
                    payload: wire,
                    reason: e.to_string(),
                    platform_hint: None,
                });
                metrics.dlq_routed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    if valid.is_empty() {
        events.ack(FASTPATH_GROUP, &ack_ids);
        return;
    }

    // Step 2: compress the remaining payloads in parallel, bounded by
    // available cores — compression is CPU-bound, decode/validate was not.
    let compressed = compress_parallel(&valid);

    // Steps 3-4: single write transaction, INSERT OR IGNORE on event_id.
    let mut items = Vec::with_capacity(compressed.len());
    let mut oversized: Vec<u64> = Vec::new();
    for ((stream_id, event), blob) in valid.iter().zip(compressed.into_iter()) {
        match blob {
            Ok(blob) => items.push((event.clone(), blob)),
            Err(e) => {
                oversized.push(*stream_id);
                dlq.append(DlqEntry {
                    original_stream_id: *stream_id,
                    payload: event.to_wire().unwrap_or_default(),
                    reason: e.to_string(),
                    platform_hint: Some(event.platform.table_fragment().to_string()),
                });
                metrics.dlq_routed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    let (outcomes, failures) = match raw_store::insert_batch(conn, &items) {
        Ok(result) => result,
        Err(e) => {
            // Step 4 failed: no ack is sent for anything, entries become
            // eligible for redelivery via claim_stale. Still ack the
            // already-DLQ'd invalid/oversized entries above since those
            // were terminal, not transient.
            tracing::error!(error = %e, "fast-path batch transaction failed, leaving entries for redelivery");
            let dlqd: std::collections::HashSet<u64> =
                valid.iter().map(|(id, _)| *id).filter(|id| !oversized.contains(id)).collect();
            let dlqd_only: Vec<u64> = ack_ids
                .iter()
                .copied()
                .filter(|id| !dlqd.contains(id))
                .collect();
            events.ack(FASTPATH_GROUP, &dlqd_only);
            return;
        }
    };
    for (event_id, reason) in &failures {
        tracing::warn!(event_id = %event_id, reason = %reason, "row skipped within batch transaction");
    }

    // Step 5: emit a CDC record for every committed row (including
    // duplicates — CDC consumers dedupe on raw_row_id).
    let items_iter = items.iter();
    for ((event, _), outcome) in items_iter.zip(outcomes.iter()) {
        match outcome {
            InsertOutcome::Inserted { .. } => metrics.rows_inserted.fetch_add(1, Ordering::Relaxed),
            InsertOutcome::Duplicate { .. } => metrics.rows_duplicate.fetch_add(1, Ordering::Relaxed),
        };
        cdc.publish_committed_row(CdcRecord {
            raw_row_id: outcome.row_id(),
            platform: event.platform,
            session_id: event.session_id().to_string(),
            event_type: event.event_type.clone(),
            timestamp: event.timestamp,
        });
    }

    // Step 6: ack all original entries — both the ones just committed and
    // the ones already routed to DLQ above, since DLQ routing is terminal.
    events.ack(FASTPATH_GROUP, &ack_ids);
}

/// Bounded CPU-bound fan-out over `std::thread::scope`, not
/// `tokio::task::spawn_blocking` — this function runs on the ingest-writer
/// thread itself, which is not async.
fn compress_parallel(valid: &[(u64, Event)]) -> Vec<Result<Vec<u8>, EngineError>> {
    let worker_count = num_cpus::get().min(8).max(1);
    let mut results: Vec<Option<Result<Vec<u8>, EngineError>>> = (0..valid.len()).map(|_| None).collect();
    thread::scope(|scope| {
        let chunk_size = valid.len().div_ceil(worker_count);
        let mut chunks: Vec<&mut [Option<Result<Vec<u8>, EngineError>>]> =
            results.chunks_mut(chunk_size.max(1)).collect();
        let input_chunks: Vec<&[(u64, Event)]> = valid.chunks(chunk_size.max(1)).collect();
        for (out_chunk, in_chunk) in chunks.iter_mut().zip(input_chunks.iter()) {
            scope.spawn(move || {
                for (slot, (_, event)) in out_chunk.iter_mut().zip(in_chunk.iter()) {
                    let result = event
                        .to_wire()
                        .and_then(|json| crate::schema::compress_json(&json));
                    *slot = Some(result);
                }
            });
        }
    });
    results.into_iter().map(|r| r.expect("every slot filled by its worker")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Platform;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU64;

    static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_db_path() -> PathBuf {
        let n = TEST_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "telemetry-engine-ingest-test-{}-{}.sqlite",
            std::process::id(),
            n
        ))
    }

    fn sample_event(event_id: &str) -> Event {
        Event {
            event_id: event_id.to_string(),
            enqueued_at: Utc::now(),
            retry_count: 0,
            platform: Platform::Claude,
            external_session_id: "sess-1".to_string(),
            hook_type: "user_prompt_submit".to_string(),
            event_type: "user_prompt_submit".to_string(),
            timestamp: Utc::now(),
            payload: serde_json::json!({"prompt_length": 42}),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn process_batch_inserts_and_acks() {
        let db_path = temp_db_path();
        let mut conn = raw_store::open(&db_path).unwrap();
        raw_store::init_schema(&conn).unwrap();
        let events: Stream<Vec<u8>> = Stream::new(100);
        let dlq: Stream<DlqEntry> = Stream::new(100);
        let cdc = CdcQueue::new();
        let metrics = IngestMetrics::default();

        let event = sample_event("e1");
        let stream_id = events.append(event.to_wire().unwrap());
        let batch = events.read_group(FASTPATH_GROUP, FASTPATH_CONSUMER, 10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].0, stream_id);

        process_batch(&mut conn, &events, &dlq, &cdc, batch, &metrics);

        assert_eq!(events.pending_count(FASTPATH_GROUP), 0);
        assert_eq!(raw_store::row_count(&conn, Platform::Claude).unwrap(), 1);
        assert_eq!(cdc.stream.len(), 1);

        std::fs::remove_file(&db_path).ok();
    }

    #[test]
    fn process_batch_routes_invalid_entries_to_dlq() {
        let db_path = temp_db_path();
        let mut conn = raw_store::open(&db_path).unwrap();
        raw_store::init_schema(&conn).unwrap();
        let events: Stream<Vec<u8>> = Stream::new(100);
        let dlq: Stream<DlqEntry> = Stream::new(100);
        let cdc = CdcQueue::new();
        let metrics = IngestMetrics::default();

        events.append(b"not json".to_vec());
        let batch = events.read_group(FASTPATH_GROUP, FASTPATH_CONSUMER, 10);
        process_batch(&mut conn, &events, &dlq, &cdc, batch, &metrics);

        assert_eq!(dlq.len(), 1);
        assert_eq!(raw_store::row_count(&conn, Platform::Claude).unwrap(), 0);

        std::fs::remove_file(&db_path).ok();
    }
}
