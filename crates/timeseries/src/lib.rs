//! Bounded in-memory time-series buffering for rule evaluation.
//!
//! This crate provides:
//! - Per-point bounded windows with a monotonic lateness watermark
//! - A sharded store so snapshots never block ingest of unrelated points
//! - Read-only aggregate snapshots consumed by actors
//! - Drop/reject counters for late and bad-quality samples

pub mod buffer;
pub mod error;
pub mod metrics;
pub mod store;

pub use buffer::{PointBuffer, PointSnapshot, TimedValue};
pub use error::BufferError;
pub use metrics::BufferMetrics;
pub use store::TimeSeriesStore;
