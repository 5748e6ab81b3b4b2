//! Evaluation-path counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Plain counters read for periodic logging, same shape as the buffer
/// metrics in the time-series crate.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    steps_evaluated: AtomicU64,
    steps_skipped: AtomicU64,
    insights_opened: AtomicU64,
    insights_resolved: AtomicU64,
    commands_requested: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EngineMetricsSnapshot {
    pub steps_evaluated: u64,
    pub steps_skipped: u64,
    pub insights_opened: u64,
    pub insights_resolved: u64,
    pub commands_requested: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_step(&self) {
        self.steps_evaluated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.steps_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insight_opened(&self) {
        self.insights_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insight_resolved(&self) {
        self.insights_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command(&self) {
        self.commands_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            steps_evaluated: self.steps_evaluated.load(Ordering::Relaxed),
            steps_skipped: self.steps_skipped.load(Ordering::Relaxed),
            insights_opened: self.insights_opened.load(Ordering::Relaxed),
            insights_resolved: self.insights_resolved.load(Ordering::Relaxed),
            commands_requested: self.commands_requested.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
        }
    }
}
