//! Drop/reject counters for the time-series store.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Plain counters, incremented on the ingest path and read for
/// periodic logging. Not an exported metrics surface.
#[derive(Debug, Default)]
pub struct BufferMetrics {
    late_dropped: AtomicU64,
    quality_rejected: AtomicU64,
    window_overflow: AtomicU64,
    ingested: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BufferMetricsSnapshot {
    pub late_dropped: u64,
    pub quality_rejected: u64,
    pub window_overflow: u64,
    pub ingested: u64,
}

impl BufferMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_late_drop(&self) {
        self.late_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quality_reject(&self) {
        self.quality_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self) {
        self.window_overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ingested(&self) {
        self.ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BufferMetricsSnapshot {
        BufferMetricsSnapshot {
            late_dropped: self.late_dropped.load(Ordering::Relaxed),
            quality_rejected: self.quality_rejected.load(Ordering::Relaxed),
            window_overflow: self.window_overflow.load(Ordering::Relaxed),
            ingested: self.ingested.load(Ordering::Relaxed),
        }
    }
}
