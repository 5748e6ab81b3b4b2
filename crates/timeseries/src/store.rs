//! [`TimeSeriesStore`] — sharded owner of all point buffers.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use faultline_core::config::BufferConfig;
use faultline_core::model::{PointId, TimeSeriesSample};

use crate::buffer::{PointBuffer, PointSnapshot, TimedValue};
use crate::error::BufferError;
use crate::metrics::BufferMetrics;

/// Owns every [`PointBuffer`], partitioned into lock shards by point id
/// so a snapshot read never blocks ingest for an unrelated point.
///
/// Ingest never suspends: shards use std locks held only for the map
/// operation. Actors read through [`snapshot`](TimeSeriesStore::snapshot)
/// and never mutate.
pub struct TimeSeriesStore {
    shards: Vec<RwLock<HashMap<PointId, PointBuffer>>>,
    /// Points with new data since the last realtime tick drained them.
    touched: Mutex<HashSet<PointId>>,
    metrics: BufferMetrics,
    max_points: usize,
    lateness_tolerance: Duration,
}

impl TimeSeriesStore {
    pub fn new(config: &BufferConfig) -> Self {
        let shard_count = config.shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            touched: Mutex::new(HashSet::new()),
            metrics: BufferMetrics::new(),
            max_points: config.max_points_per_buffer,
            lateness_tolerance: Duration::from_std(config.lateness_tolerance)
                .unwrap_or_else(|_| Duration::seconds(900)),
        }
    }

    fn shard_for(&self, point_id: &str) -> &RwLock<HashMap<PointId, PointBuffer>> {
        let mut hasher = DefaultHasher::new();
        point_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Ingest one sample into its point buffer.
    ///
    /// Late and unusable samples come back as typed errors so the
    /// caller can count them; they are expected, not failures.
    pub fn ingest(&self, sample: &TimeSeriesSample) -> Result<(), BufferError> {
        let shard = self.shard_for(&sample.point_id);
        let mut map = shard.write().expect("buffer shard lock poisoned");
        let buffer = map.entry(sample.point_id.clone()).or_insert_with(|| {
            PointBuffer::new(&sample.point_id, self.max_points, self.lateness_tolerance)
        });

        match buffer.push(sample) {
            Ok(()) => {
                drop(map);
                self.metrics.record_ingested();
                self.touched
                    .lock()
                    .expect("touched lock poisoned")
                    .insert(sample.point_id.clone());
                Ok(())
            }
            Err(e) => {
                drop(map);
                match &e {
                    BufferError::LateSampleDropped { point_id } => {
                        debug!(point_id = %point_id, ts = %sample.timestamp, "late sample dropped");
                        self.metrics.record_late_drop();
                    }
                    BufferError::UnusableSample { point_id } => {
                        debug!(point_id = %point_id, "unusable sample rejected");
                        self.metrics.record_quality_reject();
                    }
                    BufferError::BufferFull { point_id } => {
                        debug!(point_id = %point_id, "buffer full, sample rejected");
                        self.metrics.record_overflow();
                    }
                }
                Err(e)
            }
        }
    }

    /// Read-only aggregate view of one point up to `as_of`.
    pub fn snapshot(&self, point_id: &str, as_of: DateTime<Utc>) -> Option<PointSnapshot> {
        let shard = self.shard_for(point_id);
        let map = shard.read().expect("buffer shard lock poisoned");
        map.get(point_id).and_then(|b| b.snapshot(as_of))
    }

    /// Buffered values for one point within `[start, end]`.
    ///
    /// Used by backfill; limited to what the window still holds.
    pub fn range(&self, point_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TimedValue> {
        let shard = self.shard_for(point_id);
        let map = shard.read().expect("buffer shard lock poisoned");
        map.get(point_id)
            .map(|b| b.range(start, end))
            .unwrap_or_default()
    }

    /// Current watermark for one point, if it has seen data.
    pub fn watermark(&self, point_id: &str) -> Option<DateTime<Utc>> {
        let shard = self.shard_for(point_id);
        let map = shard.read().expect("buffer shard lock poisoned");
        map.get(point_id).and_then(|b| b.watermark())
    }

    /// Drain the set of points touched since the last call.
    ///
    /// The realtime tick uses this to scope which instances to step.
    pub fn take_touched(&self) -> HashSet<PointId> {
        std::mem::take(&mut *self.touched.lock().expect("touched lock poisoned"))
    }

    /// Put drained points back, merging with anything touched since.
    ///
    /// A tick that could not be dispatched restores its drained set so
    /// the retry still sees the samples that triggered it.
    pub fn restore_touched(&self, points: HashSet<PointId>) {
        self.touched
            .lock()
            .expect("touched lock poisoned")
            .extend(points);
    }

    pub fn metrics(&self) -> &BufferMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use faultline_core::Config;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn store() -> TimeSeriesStore {
        TimeSeriesStore::new(&Config::for_tests().buffer)
    }

    #[test]
    fn test_ingest_and_snapshot_across_points() {
        let store = store();
        store
            .ingest(&TimeSeriesSample::new("p1", ts(0), 1.0))
            .unwrap();
        store
            .ingest(&TimeSeriesSample::new("p2", ts(0), 2.0))
            .unwrap();

        assert_eq!(store.snapshot("p1", ts(10)).unwrap().last.value, 1.0);
        assert_eq!(store.snapshot("p2", ts(10)).unwrap().last.value, 2.0);
        assert!(store.snapshot("p3", ts(10)).is_none());
    }

    #[test]
    fn test_late_drop_counted_not_stored() {
        let store = store();
        store
            .ingest(&TimeSeriesSample::new("p1", ts(10_000), 1.0))
            .unwrap();
        let err = store
            .ingest(&TimeSeriesSample::new("p1", ts(0), 9.0))
            .unwrap_err();
        assert!(matches!(err, BufferError::LateSampleDropped { .. }));
        assert_eq!(store.metrics().snapshot().late_dropped, 1);

        // The late value is never observable through a snapshot.
        let snap = store.snapshot("p1", ts(10_000)).unwrap();
        assert_eq!(snap.count, 1);
        assert_eq!(snap.last.value, 1.0);
    }

    #[test]
    fn test_touched_points_drained_per_tick() {
        let store = store();
        store
            .ingest(&TimeSeriesSample::new("p1", ts(0), 1.0))
            .unwrap();
        store
            .ingest(&TimeSeriesSample::new("p2", ts(0), 1.0))
            .unwrap();

        let touched = store.take_touched();
        assert_eq!(touched.len(), 2);
        assert!(touched.contains("p1"));

        // Drained: a second take sees nothing until new data arrives.
        assert!(store.take_touched().is_empty());

        store
            .ingest(&TimeSeriesSample::new("p1", ts(60), 2.0))
            .unwrap();
        assert_eq!(store.take_touched().len(), 1);
    }

    #[test]
    fn test_restored_points_survive_until_next_take() {
        let store = store();
        store
            .ingest(&TimeSeriesSample::new("p1", ts(0), 1.0))
            .unwrap();

        let drained = store.take_touched();
        store.restore_touched(drained);

        // New data touched after the restore merges into the set.
        store
            .ingest(&TimeSeriesSample::new("p2", ts(0), 2.0))
            .unwrap();
        let touched = store.take_touched();
        assert!(touched.contains("p1"));
        assert!(touched.contains("p2"));
    }

    #[test]
    fn test_range_for_backfill() {
        let store = store();
        for i in 0..5 {
            store
                .ingest(&TimeSeriesSample::new("p1", ts(i * 60), i as f64))
                .unwrap();
        }
        let range = store.range("p1", ts(60), ts(180));
        assert_eq!(range.len(), 3);
        assert_eq!(range[0].value, 1.0);
        assert_eq!(range[2].value, 3.0);
    }
}
