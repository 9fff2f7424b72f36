//! Canonical event shape, wire encoding, and validation.

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// Events stay useful long after the originating process exits only because
/// every byte stored is bit-identical to what the capture agent sent.
pub const MAX_COMPRESSED_BYTES: usize = 1024 * 1024;

const ZLIB_LEVEL: u32 = 6;

/// zlib-compresses already-serialized canonical JSON and enforces the 1 MiB
/// post-compression ceiling. Kept as a free function so the ingestor can
/// run it across a thread-scope fan-out without needing a `&self`.
pub fn compress_json(json: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(ZLIB_LEVEL));
    encoder.write_all(json)?;
    let compressed = encoder.finish()?;
    if compressed.len() > MAX_COMPRESSED_BYTES {
        return Err(EngineError::PayloadTooLarge(compressed.len()));
    }
    Ok(compressed)
}

/// Inverse of [`compress_json`].
pub fn decompress_json(bytes: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(json)
}

/// Capture platform an event originated from. New platforms are added here;
/// unknown platforms never appear on the wire because capture agents are
/// expected to be built against a known `Platform` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Claude,
    Cursor,
    Windsurf,
    Other,
}

impl Platform {
    /// Table-name fragment for the raw store (`<platform>_raw_traces`).
    pub fn table_fragment(self) -> &'static str {
        match self {
            Platform::Claude => "claude",
            Platform::Cursor => "cursor",
            Platform::Windsurf => "windsurf",
            Platform::Other => "other",
        }
    }
}

/// The wire shape of a telemetry event, as defined by capture agents.
/// `event_id` is client-assigned and must be idempotent across retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    pub platform: Platform,
    pub external_session_id: String,
    pub hook_type: String,
    /// Accepted even when unrecognized; only derivation may ignore it.
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: Value,
}

impl Event {
    /// Validates required fields and the 1 MiB post-compression ceiling.
    /// Unknown `event_type` values are accepted — only downstream derivation
    /// may ignore them.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.event_id.trim().is_empty() {
            return Err(EngineError::SchemaInvalid("event_id is empty".into()));
        }
        if self.platform == Platform::Other && self.hook_type.trim().is_empty() {
            return Err(EngineError::SchemaInvalid(
                "hook_type is empty for an unidentified platform".into(),
            ));
        }
        if self.event_type.trim().is_empty() {
            return Err(EngineError::SchemaInvalid("event_type is empty".into()));
        }
        if !(self.payload.is_object() || self.payload.is_null()) {
            return Err(EngineError::SchemaInvalid(
                "payload must be a map".into(),
            ));
        }
        if !(self.metadata.is_object() || self.metadata.is_null()) {
            return Err(EngineError::SchemaInvalid(
                "metadata must be a map".into(),
            ));
        }
        Ok(())
    }

    /// Canonical JSON (serde's declaration-order field emission), uncompressed.
    /// This is the wire form queued by capture agents — the queue stores
    /// entries before the fast-path ingestor's compression step runs.
    pub fn to_wire(&self) -> Result<Vec<u8>, EngineError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Inverse of [`Event::to_wire`].
    pub fn from_wire(bytes: &[u8]) -> Result<Event, EngineError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Canonical JSON followed by zlib at a fixed level — the raw store's
    /// `event_data` column. Combines [`Event::to_wire`] with
    /// [`compress_json`]; most callers go through the ingestor's own
    /// compress step instead so this is mainly for tests and single-event
    /// convenience paths.
    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        compress_json(&self.to_wire()?)
    }

    /// Inverse of [`Event::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Event, EngineError> {
        Event::from_wire(&decompress_json(bytes)?)
    }

    pub fn session_id(&self) -> &str {
        &self.external_session_id
    }

    /// Opaque per-platform workspace identifier, if the capture agent sent
    /// one in `metadata`. Never interpreted, never compared across
    /// platforms — Claude and Cursor sessions use divergent notions of
    /// "workspace" under the hood, so this stays opaque rather than
    /// pretending to be a globally canonical key.
    pub fn workspace_hash(&self) -> Option<String> {
        self.metadata
            .get("workspace_hash")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// De-duplication key within a session for events that replace a prior
    /// item (e.g. a streaming tool-call update), if present in `metadata`.
    pub fn item_key(&self) -> Option<String> {
        self.metadata
            .get("item_key")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn round_trip_preserves_event() {
        let event = sample_event("e1");
        let encoded = event.encode().unwrap();
        let decoded = Event::decode(&encoded).unwrap();
        assert_eq!(decoded.event_id, event.event_id);
        assert_eq!(decoded.payload, event.payload);
    }

    #[test]
    fn validate_rejects_empty_event_id() {
        let mut event = sample_event("");
        event.event_id = String::new();
        assert!(matches!(
            event.validate(),
            Err(EngineError::SchemaInvalid(_))
        ));
    }

    #[test]
    fn validate_rejects_empty_event_type() {
        let mut event = sample_event("e1");
        event.event_type = String::new();
        assert!(matches!(
            event.validate(),
            Err(EngineError::SchemaInvalid(_))
        ));
    }

    #[test]
    fn validate_accepts_unknown_event_type() {
        let mut event = sample_event("e1");
        event.event_type = "some_future_event".to_string();
        assert!(event.validate().is_ok());
    }

    #[test]
    fn encode_rejects_oversize_payload() {
        let mut event = sample_event("e1");
        // A small xorshift PRNG produces high-entropy bytes that zlib
        // cannot meaningfully compress, so the encoded size stays above the
        // ceiling regardless of the compressor's ratio on typical payloads.
        let mut state: u64 = 0x1234_5678_9abc_def0;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };
        let huge: String = (0..2_000_000).map(|_| (b'a' + (next() % 26) as u8) as char).collect();
        event.payload = serde_json::json!({ "blob": huge });
        assert!(matches!(
            event.encode(),
            Err(EngineError::PayloadTooLarge(_))
        ));
    }
}
