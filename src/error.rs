//! Error taxonomy for the pipeline's propagation policy. Six variants, each
//! with a clearly defined retry/terminal disposition, plus the narrow
//! `#[from]` conversions the engine actually needs at its I/O boundaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Event fails validation. Route to DLQ, do not retry.
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    /// Compressed payload exceeds the 1 MiB ceiling. Route to DLQ as a
    /// specialization of schema invalidity.
    #[error("payload too large: {0} bytes post-compression")]
    PayloadTooLarge(usize),

    /// Store or queue unreachable. No-ack, redeliver with backoff.
    #[error("transient I/O error: {0}")]
    TransientIO(String),

    /// Unique-index collision on `event_id`. Treated as success by callers;
    /// exists so callers can still emit a CDC record for the existing row.
    #[error("duplicate event: {0}")]
    DuplicateEvent(String),

    /// A slow-path worker saw a record outside its partition.
    #[error("partition misroute: session {session_id} does not belong to this worker")]
    PartitionMisroute { session_id: String },

    /// Enrichment failed on a specific blob. Write a structured error
    /// record, ack, continue.
    #[error("derivation error: {0}")]
    DerivationError(String),

    /// Local database corruption, disk full. Stop the supervisor.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::TransientIO(e.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::TransientIO(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::SchemaInvalid(e.to_string())
    }
}

impl EngineError {
    /// Whether the propagation policy treats this as retryable (transient)
    /// versus terminal (route to DLQ / skip-and-log).
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientIO(_))
    }
}
