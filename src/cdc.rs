//! Change-data-capture fan-out: a secondary append-only stream publishing
//! committed raw-row identifiers, decoupling raw-store durability from
//! derived-view computation. This stream is the narrow waist between the
//! fast and slow paths.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::Stream;
use crate::schema::Platform;

/// Default MAXLEN for the CDC stream.
pub const DEFAULT_CDC_MAXLEN: usize = 100_000;

/// A compact, uncompressed record naming a newly committed raw row.
/// Consumers dedupe on `raw_row_id` since emission is at-least-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcRecord {
    pub raw_row_id: i64,
    pub platform: Platform,
    pub session_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Handle to the CDC stream, shared between the fast-path ingestor
/// (producer) and the slow-path worker pool (consumers).
#[derive(Clone)]
pub struct CdcQueue {
    pub stream: Arc<Stream<CdcRecord>>,
}

impl CdcQueue {
    pub fn new() -> Self {
        Self::with_maxlen(DEFAULT_CDC_MAXLEN)
    }

    pub fn with_maxlen(maxlen: usize) -> Self {
        CdcQueue {
            stream: Arc::new(Stream::new(maxlen)),
        }
    }

    /// Appends one CDC record per committed raw row. Called by the
    /// fast-path ingestor immediately after each transaction commit, before
    /// the original `events` entries are acked.
    pub fn publish_committed_row(&self, record: CdcRecord) -> u64 {
        self.stream.append(record)
    }
}

impl Default for CdcQueue {
    fn default() -> Self {
        Self::new()
    }
}
