//! Shared state and the composite updater: cross-worker atomic counters,
//! TTL string values, a single-holder TTL lock, and the singleton
//! background composite-metrics job. A per-event time-boundary check
//! (`time.now() mod 10 == 0`) would let multiple workers cross the same
//! boundary in the same tick and duplicate the work; one dedicated task
//! bounds composite cost to O(1) every `interval_s` regardless of event
//! rate instead.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::CompositeConfig;
use crate::error::EngineError;
use crate::metrics_store::{self, MetricPoint};

/// Process-wide counters, TTL strings, and the composite-calc lock, shared
/// across every slow-path worker. Counters are updated by atomic increments
/// only — never mirrored in per-worker memory except as read-through
/// caches invalidated every batch.
pub struct SharedState {
    counters: DashMap<String, AtomicI64>,
    ttl_values: DashMap<String, (String, Instant)>,
    composite_lock: Mutex<Option<(String, Instant)>>,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(SharedState {
            counters: DashMap::new(),
            ttl_values: DashMap::new(),
            composite_lock: Mutex::new(None),
        })
    }

    /// Atomically adds `delta` to a named counter, creating it at zero if
    /// absent, and returns the new value.
    pub fn incr(&self, key: &str, delta: i64) -> i64 {
        let entry = self.counters.entry(key.to_string()).or_insert_with(|| AtomicI64::new(0));
        entry.fetch_add(delta, Ordering::SeqCst) + delta
    }

    pub fn get_counter(&self, key: &str) -> i64 {
        self.counters
            .get(key)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Sets a string value with a TTL; reads after expiry return `None`.
    pub fn set_ttl(&self, key: &str, value: String, ttl: Duration) {
        self.ttl_values.insert(key.to_string(), (value, Instant::now() + ttl));
    }

    pub fn get_ttl(&self, key: &str) -> Option<String> {
        let entry = self.ttl_values.get(key)?;
        let (value, expires_at) = entry.value();
        if Instant::now() >= *expires_at {
            drop(entry);
            self.ttl_values.remove(key);
            None
        } else {
            Some(value.clone())
        }
    }

    /// Non-blocking single-holder lock acquire with an expiry, i.e. Redis's
    /// `SET key value NX EX ttl`. Returns whether the caller now holds it.
    /// A stale holder whose TTL has passed is treated as unheld.
    pub fn try_lock(&self, key: &str, holder: &str, ttl: Duration) -> bool {
        let mut guard = self.composite_lock.lock();
        let now = Instant::now();
        match guard.as_ref() {
            Some((_, expires_at)) if *expires_at > now => {
                let _ = key;
                false
            }
            _ => {
                *guard = Some((holder.to_string(), now + ttl));
                true
            }
        }
    }

    /// Releases the lock, but only if `holder` is the current owner — a
    /// late release from a worker whose TTL already expired and was
    /// reacquired elsewhere must not clobber the new holder.
    pub fn unlock(&self, holder: &str) {
        let mut guard = self.composite_lock.lock();
        if matches!(guard.as_ref(), Some((h, _)) if h == holder) {
            *guard = None;
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        SharedState {
            counters: DashMap::new(),
            ttl_values: DashMap::new(),
            composite_lock: Mutex::new(None),
        }
    }
}

const LAST_COMPOSITE_CALC_KEY: &str = "last_composite_calc_at";
const COMPOSITE_LOCK_KEY: &str = "composite";

/// Counter names the composite job reads. Slow-path workers increment
/// these as they derive per-event metrics; the composite job reads all
/// three on every tick.
pub const COUNTER_SUCCESSES: &str = "composite.successes";
pub const COUNTER_ACCEPTANCES: &str = "composite.acceptances";
pub const COUNTER_TOOL_INVOCATIONS: &str = "composite.tool_invocations";

/// Computes the weighted productivity composite from the three counters.
/// A pure function so the cadence test can exercise it without touching
/// the store.
pub fn compute_productivity_score(successes: i64, acceptances: i64, tool_invocations: i64) -> f64 {
    0.5 * successes as f64 + 0.3 * acceptances as f64 + 0.2 * tool_invocations as f64
}

/// Spawns the singleton composite updater task. Exactly one of these runs
/// per process — never one per worker — bounding composite cost to
/// O(1) per `interval_s` regardless of event rate.
pub fn spawn_composite_updater(
    shared: Arc<SharedState>,
    metrics_db: Arc<Mutex<rusqlite::Connection>>,
    config: CompositeConfig,
    holder_id: String,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(config.interval_s);
        let ttl = Duration::from_secs(config.lock_ttl_s);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            if !shared.try_lock(COMPOSITE_LOCK_KEY, &holder_id, ttl) {
                tracing::trace!("composite updater: lock held elsewhere, skipping this tick");
                continue;
            }
            if let Err(e) = run_composite_calc(&shared, &metrics_db) {
                tracing::warn!(error = %e, "composite updater: calculation failed, continuing");
            }
            shared.unlock(&holder_id);
        }
    })
}

fn run_composite_calc(
    shared: &SharedState,
    metrics_db: &Mutex<rusqlite::Connection>,
) -> Result<(), EngineError> {
    let successes = shared.get_counter(COUNTER_SUCCESSES);
    let acceptances = shared.get_counter(COUNTER_ACCEPTANCES);
    let tool_invocations = shared.get_counter(COUNTER_TOOL_INVOCATIONS);
    let score = compute_productivity_score(successes, acceptances, tool_invocations);

    let now = chrono::Utc::now();
    let point = MetricPoint {
        category: "composite".to_string(),
        name: "productivity_score".to_string(),
        session_id: None,
        value: score,
        timestamp: now,
    };
    {
        let conn = metrics_db.lock();
        metrics_store::record(&conn, &point)?;
    }
    shared.set_ttl(LAST_COMPOSITE_CALC_KEY, now.to_rfc3339(), Duration::from_secs(3600));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incr_accumulates_across_calls() {
        let shared = SharedState::new();
        shared.incr("x", 1);
        shared.incr("x", 2);
        assert_eq!(shared.get_counter("x"), 3);
    }

    #[test]
    fn try_lock_is_single_holder() {
        let shared = SharedState::new();
        assert!(shared.try_lock("composite", "worker-a", Duration::from_secs(5)));
        assert!(!shared.try_lock("composite", "worker-b", Duration::from_secs(5)));
    }

    #[test]
    fn unlock_only_releases_for_current_holder() {
        let shared = SharedState::new();
        shared.try_lock("composite", "worker-a", Duration::from_secs(5));
        shared.unlock("worker-b");
        assert!(!shared.try_lock("composite", "worker-c", Duration::from_secs(5)));
        shared.unlock("worker-a");
        assert!(shared.try_lock("composite", "worker-c", Duration::from_secs(5)));
    }

    #[test]
    fn ttl_value_expires() {
        let shared = SharedState::new();
        shared.set_ttl("k", "v".to_string(), Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(shared.get_ttl("k"), None);
    }

    #[test]
    fn composite_score_is_weighted_sum() {
        let score = compute_productivity_score(10, 5, 2);
        assert!((score - (5.0 + 1.5 + 0.4)).abs() < 1e-9);
    }
}
