//! Metrics store: a time-series table keyed by
//! `(category, name, session_id)`, with `record`/`range`/coarse aggregation
//! and per-category retention. Lives in the same physical database file as
//! the raw and derived stores, in its own tables.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::RetentionConfig;
use crate::error::EngineError;

/// Default retention for raw (un-rolled-up) points.
pub const DEFAULT_RAW_RETENTION_HOURS: i64 = 24;
/// Default retention for per-minute rollups.
pub const DEFAULT_PER_MINUTE_RETENTION_DAYS: i64 = 30;
/// Default retention for per-hour rollups.
pub const DEFAULT_PER_HOUR_RETENTION_YEARS: i64 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), EngineError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metric_points (
            category TEXT NOT NULL,
            name TEXT NOT NULL,
            session_id TEXT,
            value REAL NOT NULL,
            timestamp TEXT NOT NULL
         );
         CREATE UNIQUE INDEX IF NOT EXISTS idx_metric_points_identity
             ON metric_points(category, name, COALESCE(session_id, ''), timestamp);
         CREATE INDEX IF NOT EXISTS idx_metric_points_range
             ON metric_points(category, name, timestamp);

         CREATE TABLE IF NOT EXISTS metric_points_minute (
            category TEXT NOT NULL,
            name TEXT NOT NULL,
            session_id TEXT,
            bucket TEXT NOT NULL,
            value_sum REAL NOT NULL,
            sample_count INTEGER NOT NULL,
            PRIMARY KEY (category, name, COALESCE(session_id, ''), bucket)
         );

         CREATE TABLE IF NOT EXISTS metric_points_hour (
            category TEXT NOT NULL,
            name TEXT NOT NULL,
            session_id TEXT,
            bucket TEXT NOT NULL,
            value_sum REAL NOT NULL,
            sample_count INTEGER NOT NULL,
            PRIMARY KEY (category, name, COALESCE(session_id, ''), bucket)
         );",
    )?;
    Ok(())
}

/// A point to record. `session_id` is absent for session-less composite
/// metrics.
#[derive(Debug, Clone)]
pub struct MetricPoint {
    pub category: String,
    pub name: String,
    pub session_id: Option<String>,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Records one point. Duplicate writes at the same
/// `(category, name, session_id, timestamp)` are coalesced by replacing the
/// prior value rather than accumulating a second row.
pub fn record(conn: &Connection, point: &MetricPoint) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO metric_points (category, name, session_id, value, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(category, name, COALESCE(session_id, ''), timestamp)
         DO UPDATE SET value = excluded.value",
        params![
            point.category,
            point.name,
            point.session_id,
            point.value,
            point.timestamp.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Records a batch within one transaction (C6 step 4: "Record metrics to C8
/// in one batch").
pub fn record_batch(conn: &mut Connection, points: &[MetricPoint]) -> Result<(), EngineError> {
    let tx = conn.transaction()?;
    for point in points {
        record(&tx, point)?;
    }
    tx.commit()?;
    Ok(())
}

/// Ranges over raw points for `(category, name)` within `[from, to]`,
/// downsampling to at most `max_points` by fixed stride if the window holds
/// more than that.
pub fn range(
    conn: &Connection,
    category: &str,
    name: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    max_points: usize,
) -> Result<Vec<(DateTime<Utc>, f64)>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT timestamp, value FROM metric_points
         WHERE category = ?1 AND name = ?2 AND timestamp >= ?3 AND timestamp <= ?4
         ORDER BY timestamp ASC",
    )?;
    let rows: Vec<(String, f64)> = stmt
        .query_map(
            params![category, name, from.to_rfc3339(), to.to_rfc3339()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let points: Vec<(DateTime<Utc>, f64)> = rows
        .into_iter()
        .map(|(ts, value)| {
            let parsed = DateTime::parse_from_rfc3339(&ts)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(to);
            (parsed, value)
        })
        .collect();

    if max_points == 0 || points.len() <= max_points {
        return Ok(points);
    }
    let stride = points.len().div_ceil(max_points);
    Ok(points.into_iter().step_by(stride).collect())
}

/// Coarse aggregation: sum and count of raw points in `[from, to]`.
pub fn aggregate(
    conn: &Connection,
    category: &str,
    name: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<(f64, usize), EngineError> {
    conn.query_row(
        "SELECT COALESCE(SUM(value), 0.0), COUNT(*) FROM metric_points
         WHERE category = ?1 AND name = ?2 AND timestamp >= ?3 AND timestamp <= ?4",
        params![category, name, from.to_rfc3339(), to.to_rfc3339()],
        |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as usize)),
    )
    .optional()
    .map(|opt| opt.unwrap_or((0.0, 0)))
    .map_err(EngineError::from)
}

/// Rolls un-rolled-up raw points into the per-minute/per-hour tables and
/// prunes anything past its category's retention. Runs periodically
/// alongside the composite updater rather than per event.
pub fn run_retention_sweep(
    conn: &mut Connection,
    raw_retention_hours: i64,
    per_minute_retention_days: i64,
    per_hour_retention_years: i64,
) -> Result<RetentionReport, EngineError> {
    let tx = conn.transaction()?;
    let now = Utc::now();

    let raw_cutoff = now - chrono::Duration::hours(raw_retention_hours);
    let rolled_minute: i64 = tx.query_row(
        "SELECT COUNT(*) FROM (
            SELECT category, name, session_id,
                   strftime('%Y-%m-%dT%H:%M:00Z', timestamp) AS bucket
            FROM metric_points WHERE timestamp < ?1 GROUP BY 1,2,3,4
         )",
        params![raw_cutoff.to_rfc3339()],
        |row| row.get(0),
    )?;
    tx.execute(
        "INSERT INTO metric_points_minute (category, name, session_id, bucket, value_sum, sample_count)
         SELECT category, name, session_id,
                strftime('%Y-%m-%dT%H:%M:00Z', timestamp) AS bucket,
                SUM(value), COUNT(*)
         FROM metric_points WHERE timestamp < ?1
         GROUP BY category, name, session_id, bucket
         ON CONFLICT(category, name, COALESCE(session_id, ''), bucket) DO UPDATE SET
            value_sum = value_sum + excluded.value_sum,
            sample_count = sample_count + excluded.sample_count",
        params![raw_cutoff.to_rfc3339()],
    )?;
    let raw_deleted = tx.execute(
        "DELETE FROM metric_points WHERE timestamp < ?1",
        params![raw_cutoff.to_rfc3339()],
    )?;

    let minute_cutoff = now - chrono::Duration::days(per_minute_retention_days);
    tx.execute(
        "INSERT INTO metric_points_hour (category, name, session_id, bucket, value_sum, sample_count)
         SELECT category, name, session_id,
                substr(bucket, 1, 13) || ':00:00Z' AS hour_bucket,
                SUM(value_sum), SUM(sample_count)
         FROM metric_points_minute WHERE bucket < ?1
         GROUP BY category, name, session_id, hour_bucket
         ON CONFLICT(category, name, COALESCE(session_id, ''), bucket) DO UPDATE SET
            value_sum = value_sum + excluded.value_sum,
            sample_count = sample_count + excluded.sample_count",
        params![minute_cutoff.to_rfc3339()],
    )?;
    let minute_deleted = tx.execute(
        "DELETE FROM metric_points_minute WHERE bucket < ?1",
        params![minute_cutoff.to_rfc3339()],
    )?;

    let hour_cutoff = now - chrono::Duration::days(per_hour_retention_years * 365);
    let hour_deleted = tx.execute(
        "DELETE FROM metric_points_hour WHERE bucket < ?1",
        params![hour_cutoff.to_rfc3339()],
    )?;

    tx.commit()?;
    Ok(RetentionReport {
        raw_rolled_into_minute: rolled_minute as u64,
        raw_deleted: raw_deleted as u64,
        minute_deleted: minute_deleted as u64,
        hour_deleted: hour_deleted as u64,
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionReport {
    pub raw_rolled_into_minute: u64,
    pub raw_deleted: u64,
    pub minute_deleted: u64,
    pub hour_deleted: u64,
}

/// Cadence the retention sweep runs at — a distinct timer from the
/// composite updater's.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawns the singleton retention/rollup sweeper: exactly one `tokio::task`
/// per process, never one per slow-path worker, the same singleton-task
/// idiom [`crate::shared_state::spawn_composite_updater`] uses. Runs
/// [`run_retention_sweep`] on its own timer against its own connection so
/// it never contends with a slow-path worker's in-flight transaction.
pub fn spawn_retention_sweeper(
    conn: Arc<Mutex<Connection>>,
    retention: RetentionConfig,
    shutdown: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            let report = {
                let mut guard = conn.lock();
                run_retention_sweep(
                    &mut guard,
                    retention.raw_hours,
                    retention.per_minute_days,
                    retention.per_hour_years,
                )
            };
            match report {
                Ok(report) => tracing::debug!(
                    raw_rolled_into_minute = report.raw_rolled_into_minute,
                    raw_deleted = report.raw_deleted,
                    minute_deleted = report.minute_deleted,
                    hour_deleted = report.hour_deleted,
                    "metrics retention sweep complete"
                ),
                Err(e) => tracing::warn!(error = %e, "metrics retention sweep failed, continuing"),
            }
        }
    })
}
