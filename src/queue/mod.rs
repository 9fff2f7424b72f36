//! Durable queue: an in-process, append-only log per named stream with
//! consumer groups, pending-entry lists (PEL), and MAXLEN trimming.
//!
//! The engine is explicitly single-machine, so there is no network broker
//! behind this — `Stream<T>` *is* the embedded queue. Each stream is
//! independent; `events`, `events.dlq`, and `cdc` are three separate
//! `Stream` instances wired together by [`crate::ingest`] and
//! [`crate::cdc`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default visibility timeout before an unacknowledged entry becomes
/// eligible for reclaim.
pub const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 30_000;

/// Default MAXLEN for the live window.
pub const DEFAULT_MAXLEN: usize = 10_000;

/// Default retry ceiling before an entry is routed to the DLQ.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

struct PendingEntry<T> {
    entry: T,
    consumer: String,
    delivered_at: Instant,
    retry_count: u32,
}

#[derive(Default)]
struct GroupState<T> {
    /// Next stream id not yet delivered to any consumer in this group.
    next_offset: u64,
    /// Delivered-but-unacknowledged entries, keyed by stream id.
    pel: BTreeMap<u64, PendingEntry<T>>,
}

struct Inner<T> {
    log: VecDeque<(u64, T)>,
    next_id: u64,
    maxlen: usize,
    groups: HashMap<String, GroupState<T>>,
}

/// A single named, totally-ordered, append-only stream with consumer-group
/// fan-out. Cloning `T` on delivery keeps the log itself immutable and lets
/// multiple consumer groups read the same entries independently.
pub struct Stream<T: Clone> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> Stream<T> {
    pub fn new(maxlen: usize) -> Self {
        Stream {
            inner: Mutex::new(Inner {
                log: VecDeque::new(),
                next_id: 1,
                maxlen,
                groups: HashMap::new(),
            }),
        }
    }

    /// `append(stream, entry) -> stream_id`. O(1) amortized; trims the log
    /// to `maxlen` once it's full, oldest first.
    pub fn append(&self, entry: T) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.log.push_back((id, entry));
        if inner.log.len() > inner.maxlen {
            inner.log.pop_front();
        }
        id
    }

    /// `read_group(stream, group, consumer, count, ...)`. Delivers up to
    /// `count` not-yet-delivered entries to `consumer`, registering them in
    /// that group's PEL. Non-blocking; callers implement `block_ms` by
    /// polling or awaiting a wake signal (see [`crate::ingest`]).
    pub fn read_group(&self, group: &str, consumer: &str, count: usize) -> Vec<(u64, T)> {
        let mut inner = self.inner.lock();
        let log_start_id = inner.log.front().map(|(id, _)| *id).unwrap_or(inner.next_id);
        let group_state = inner.groups.entry(group.to_string()).or_default();
        if group_state.next_offset < log_start_id {
            // Entries were trimmed before this group ever read them.
            group_state.next_offset = log_start_id;
        }
        let start = group_state.next_offset;
        let mut delivered = Vec::with_capacity(count);
        for (id, entry) in inner.log.iter() {
            if *id < start {
                continue;
            }
            if delivered.len() >= count {
                break;
            }
            delivered.push((*id, entry.clone()));
        }
        let mut max_id = start.saturating_sub(1);
        for (id, entry) in &delivered {
            max_id = max_id.max(*id);
            group_state.pel.insert(
                *id,
                PendingEntry {
                    entry: entry.clone(),
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    retry_count: 0,
                },
            );
        }
        if !delivered.is_empty() {
            group_state.next_offset = max_id + 1;
        }
        delivered
    }

    /// `ack(stream, group, stream_id[])`. Removes entries from the PEL.
    pub fn ack(&self, group: &str, ids: &[u64]) {
        let mut inner = self.inner.lock();
        if let Some(group_state) = inner.groups.get_mut(group) {
            for id in ids {
                group_state.pel.remove(id);
            }
        }
    }

    /// `claim_stale(stream, group, min_idle_ms) -> [entries]`. Reassigns
    /// entries whose PEL idle time exceeds the threshold to `claimer`,
    /// incrementing `retry_count`. Entries whose `retry_count` would cross
    /// `max_retries` are returned separately for the caller to DLQ instead
    /// of redelivering again.
    pub fn claim_stale(
        &self,
        group: &str,
        claimer: &str,
        min_idle: Duration,
        max_retries: u32,
    ) -> ClaimResult<T> {
        let mut inner = self.inner.lock();
        let mut redelivered = Vec::new();
        let mut dead_lettered = Vec::new();
        if let Some(group_state) = inner.groups.get_mut(group) {
            let now = Instant::now();
            for (id, pending) in group_state.pel.iter_mut() {
                if now.duration_since(pending.delivered_at) < min_idle {
                    continue;
                }
                pending.retry_count += 1;
                pending.consumer = claimer.to_string();
                pending.delivered_at = now;
                if pending.retry_count >= max_retries {
                    dead_lettered.push((*id, pending.entry.clone(), pending.retry_count));
                } else {
                    redelivered.push((*id, pending.entry.clone()));
                }
            }
            for (id, _, _) in &dead_lettered {
                group_state.pel.remove(id);
            }
        }
        ClaimResult {
            redelivered,
            dead_lettered,
        }
    }

    /// Number of entries currently pending (delivered, unacknowledged) for a
    /// group. Used by the supervisor's readiness/backlog reporting.
    pub fn pending_count(&self, group: &str) -> usize {
        let inner = self.inner.lock();
        inner.groups.get(group).map(|g| g.pel.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ClaimResult<T> {
    pub redelivered: Vec<(u64, T)>,
    /// `(stream_id, entry, retry_count)` of entries that crossed
    /// `max_retries` and must be moved to the DLQ by the caller.
    pub dead_lettered: Vec<(u64, T, u32)>,
}

/// An entry that failed terminally and was moved out of `events` into
/// `events.dlq`, carrying enough context for `replay(filter)` to reconstruct
/// a fresh `events` entry with `retry_count` reset.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub original_stream_id: u64,
    pub payload: Vec<u8>,
    pub reason: String,
    pub platform_hint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_assigns_increasing_ids() {
        let stream: Stream<i32> = Stream::new(100);
        let a = stream.append(1);
        let b = stream.append(2);
        assert!(b > a);
    }

    #[test]
    fn read_group_delivers_each_entry_once_per_group() {
        let stream: Stream<i32> = Stream::new(100);
        stream.append(1);
        stream.append(2);
        let first = stream.read_group("g", "c1", 10);
        assert_eq!(first.len(), 2);
        let second = stream.read_group("g", "c1", 10);
        assert!(second.is_empty());
    }

    #[test]
    fn ack_clears_pel() {
        let stream: Stream<i32> = Stream::new(100);
        let id = stream.append(1);
        stream.read_group("g", "c1", 10);
        assert_eq!(stream.pending_count("g"), 1);
        stream.ack("g", &[id]);
        assert_eq!(stream.pending_count("g"), 0);
    }

    #[test]
    fn claim_stale_redelivers_after_idle_threshold() {
        let stream: Stream<i32> = Stream::new(100);
        stream.append(1);
        stream.read_group("g", "c1", 10);
        let immediate = stream.claim_stale("g", "c2", Duration::from_secs(30), 5);
        assert!(immediate.redelivered.is_empty());
        let claimed = stream.claim_stale("g", "c2", Duration::from_millis(0), 5);
        assert_eq!(claimed.redelivered.len(), 1);
    }

    #[test]
    fn claim_stale_dead_letters_past_max_retries() {
        let stream: Stream<i32> = Stream::new(100);
        stream.append(1);
        stream.read_group("g", "c1", 10);
        for _ in 0..2 {
            stream.claim_stale("g", "c2", Duration::from_millis(0), 3);
        }
        let result = stream.claim_stale("g", "c2", Duration::from_millis(0), 3);
        assert_eq!(result.dead_lettered.len(), 1);
        assert_eq!(stream.pending_count("g"), 0);
    }

    #[test]
    fn maxlen_trims_oldest_entries() {
        let stream: Stream<i32> = Stream::new(2);
        stream.append(1);
        stream.append(2);
        stream.append(3);
        assert_eq!(stream.len(), 2);
    }

    #[test]
    fn read_group_skips_entries_trimmed_before_first_read() {
        let stream: Stream<i32> = Stream::new(2);
        stream.append(1);
        stream.append(2);
        stream.append(3); // trims id 1
        let delivered = stream.read_group("g", "c1", 10);
        assert_eq!(delivered.len(), 2);
    }
}
