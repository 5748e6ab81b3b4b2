//! [`PointBuffer`] — bounded, ordered window of samples for one point.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use faultline_core::model::{PointId, TimeSeriesSample};

use crate::error::BufferError;

/// A single timestamped value inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimedValue {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Ordered bounded window of recent samples for one point, plus the
/// rolling aggregate actors read through [`PointSnapshot`].
///
/// The watermark advances monotonically as `max timestamp seen -
/// lateness tolerance`; anything older than the watermark is dropped
/// at ingest so memory and evaluation latency stay bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointBuffer {
    pub point_id: PointId,
    values: Vec<TimedValue>,
    /// Max timestamp ever accepted; watermark derives from it.
    max_seen: Option<DateTime<Utc>>,
    /// Gap between the two most recent samples.
    last_gap: Option<Duration>,
    max_points: usize,
    lateness_tolerance: Duration,
}

impl PointBuffer {
    pub fn new(point_id: &str, max_points: usize, lateness_tolerance: Duration) -> Self {
        Self {
            point_id: point_id.to_string(),
            values: Vec::new(),
            max_seen: None,
            last_gap: None,
            max_points,
            lateness_tolerance,
        }
    }

    /// The timestamp boundary beyond which older samples are too late.
    ///
    /// `None` until the first sample arrives. Never moves backward.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.max_seen.map(|t| t - self.lateness_tolerance)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Insert a sample, keeping the window ordered by timestamp.
    ///
    /// Late samples (older than the watermark) and duplicate timestamps
    /// are dropped. Out-of-order arrival within the tolerance is
    /// accepted and sorted into place.
    pub fn push(&mut self, sample: &TimeSeriesSample) -> Result<(), BufferError> {
        if !sample.is_usable() {
            return Err(BufferError::UnusableSample {
                point_id: self.point_id.clone(),
            });
        }

        if let Some(watermark) = self.watermark() {
            if sample.timestamp < watermark {
                return Err(BufferError::LateSampleDropped {
                    point_id: self.point_id.clone(),
                });
            }
        }

        // Find the insertion point from the back — in-order arrival is
        // the common case.
        let mut idx = self.values.len();
        while idx > 0 {
            let existing = self.values[idx - 1].timestamp;
            if existing < sample.timestamp {
                break;
            }
            if existing == sample.timestamp {
                // Duplicate timestamp: first writer wins.
                return Ok(());
            }
            idx -= 1;
        }

        if self.values.len() >= self.max_points {
            if idx == 0 {
                // Older than everything retained in a full window.
                return Err(BufferError::BufferFull {
                    point_id: self.point_id.clone(),
                });
            }
            self.values.remove(0);
            idx -= 1;
        }

        self.values.insert(
            idx,
            TimedValue {
                timestamp: sample.timestamp,
                value: sample.value,
            },
        );

        if self.max_seen.map(|t| sample.timestamp > t).unwrap_or(true) {
            self.max_seen = Some(sample.timestamp);
        }
        if self.values.len() >= 2 {
            let last = self.values[self.values.len() - 1].timestamp;
            let prev = self.values[self.values.len() - 2].timestamp;
            self.last_gap = Some(last - prev);
        }

        Ok(())
    }

    pub fn last(&self) -> Option<TimedValue> {
        self.values.last().copied()
    }

    pub fn previous(&self) -> Option<TimedValue> {
        if self.values.len() >= 2 {
            Some(self.values[self.values.len() - 2])
        } else {
            None
        }
    }

    /// Gap between the two most recent samples.
    pub fn last_gap(&self) -> Option<Duration> {
        self.last_gap
    }

    /// Values with `start <= timestamp <= end`, in timestamp order.
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TimedValue> {
        self.values
            .iter()
            .filter(|v| v.timestamp >= start && v.timestamp <= end)
            .copied()
            .collect()
    }

    /// Read-only point-in-time view over samples up to `as_of`.
    ///
    /// Returns `None` when nothing at or before `as_of` exists.
    pub fn snapshot(&self, as_of: DateTime<Utc>) -> Option<PointSnapshot> {
        let visible: Vec<&TimedValue> = self
            .values
            .iter()
            .filter(|v| v.timestamp <= as_of)
            .collect();
        let last = **visible.last()?;
        let previous = if visible.len() >= 2 {
            Some(*visible[visible.len() - 2])
        } else {
            None
        };

        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for v in &visible {
            sum += v.value;
            min = min.min(v.value);
            max = max.max(v.value);
        }

        Some(PointSnapshot {
            point_id: self.point_id.clone(),
            as_of,
            last,
            previous,
            count: visible.len(),
            sum,
            min,
            max,
        })
    }

    /// Debug check: window must be strictly ordered by timestamp.
    pub fn is_ordered(&self) -> bool {
        self.values
            .windows(2)
            .all(|w| w[0].timestamp < w[1].timestamp)
    }
}

/// Rolling aggregate over one point's window, up to a point in time.
///
/// This is what actors see — they never touch the buffer directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointSnapshot {
    pub point_id: PointId,
    pub as_of: DateTime<Utc>,
    pub last: TimedValue,
    pub previous: Option<TimedValue>,
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl PointSnapshot {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Value delta between the last two visible samples.
    pub fn last_delta(&self) -> Option<f64> {
        self.previous.map(|p| self.last.value - p.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample(secs: i64, value: f64) -> TimeSeriesSample {
        TimeSeriesSample::new("p1", ts(secs), value)
    }

    fn buffer() -> PointBuffer {
        PointBuffer::new("p1", 100, Duration::seconds(300))
    }

    #[test]
    fn test_in_order_ingest_and_snapshot() {
        let mut buf = buffer();
        buf.push(&sample(0, 70.0)).unwrap();
        buf.push(&sample(60, 90.0)).unwrap();
        buf.push(&sample(120, 95.0)).unwrap();

        let snap = buf.snapshot(ts(120)).unwrap();
        assert_eq!(snap.last.value, 95.0);
        assert_eq!(snap.previous.unwrap().value, 90.0);
        assert_eq!(snap.count, 3);
        assert_eq!(snap.max, 95.0);
        assert_eq!(snap.min, 70.0);
        assert_eq!(snap.last_delta(), Some(5.0));
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let mut buf = buffer();
        buf.push(&sample(0, 70.0)).unwrap();
        buf.push(&sample(60, 90.0)).unwrap();

        let snap = buf.snapshot(ts(30)).unwrap();
        assert_eq!(snap.last.value, 70.0);
        assert_eq!(snap.count, 1);

        assert!(buf.snapshot(ts(-10)).is_none());
    }

    #[test]
    fn test_out_of_order_within_tolerance_is_sorted_in() {
        let mut buf = buffer();
        buf.push(&sample(0, 1.0)).unwrap();
        buf.push(&sample(120, 3.0)).unwrap();
        buf.push(&sample(60, 2.0)).unwrap();

        assert!(buf.is_ordered());
        let snap = buf.snapshot(ts(120)).unwrap();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.previous.unwrap().value, 2.0);
    }

    #[test]
    fn test_late_sample_dropped_and_never_observed() {
        let mut buf = buffer();
        buf.push(&sample(1000, 5.0)).unwrap();

        // Watermark is at t=700; t=100 is too late.
        let err = buf.push(&sample(100, 9.0)).unwrap_err();
        assert!(matches!(err, BufferError::LateSampleDropped { .. }));

        let snap = buf.snapshot(ts(1000)).unwrap();
        assert_eq!(snap.count, 1);
        assert_eq!(snap.last.value, 5.0);
    }

    #[test]
    fn test_watermark_monotonic() {
        let mut buf = buffer();
        buf.push(&sample(1000, 1.0)).unwrap();
        let w1 = buf.watermark().unwrap();

        // Older-but-tolerated sample must not move the watermark back.
        buf.push(&sample(900, 2.0)).unwrap();
        assert_eq!(buf.watermark().unwrap(), w1);

        buf.push(&sample(2000, 3.0)).unwrap();
        assert!(buf.watermark().unwrap() > w1);
    }

    #[test]
    fn test_duplicate_timestamp_first_writer_wins() {
        let mut buf = buffer();
        buf.push(&sample(0, 1.0)).unwrap();
        buf.push(&sample(0, 99.0)).unwrap();
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.last().unwrap().value, 1.0);
    }

    #[test]
    fn test_window_cap_evicts_oldest() {
        let mut buf = PointBuffer::new("p1", 3, Duration::seconds(10_000));
        for i in 0..5 {
            buf.push(&sample(i * 60, i as f64)).unwrap();
        }
        assert_eq!(buf.len(), 3);
        let snap = buf.snapshot(ts(240)).unwrap();
        assert_eq!(snap.min, 2.0);
        assert_eq!(snap.last.value, 4.0);
    }

    #[test]
    fn test_unusable_sample_rejected() {
        let mut buf = buffer();
        let err = buf.push(&sample(0, f64::NAN)).unwrap_err();
        assert!(matches!(err, BufferError::UnusableSample { .. }));
        assert!(buf.is_empty());
    }
}
