//! Telemetry processing engine: a local-only pipeline that durably queues
//! capture-agent events, persists them losslessly, and derives conversation
//! and time-series views under bounded ingest latency.
//!
//! `src/main.rs` is a thin binary wrapper around this library so integration
//! tests under `tests/` can drive the engine's components directly instead
//! of spawning the process.

pub mod cdc;
pub mod cli;
pub mod config;
pub mod demo;
pub mod derived_store;
pub mod error;
pub mod http;
pub mod ingest;
pub mod metrics_store;
pub mod queue;
pub mod raw_store;
pub mod schema;
pub mod shared_state;
pub mod supervisor;
pub mod workers;
