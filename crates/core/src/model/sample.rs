use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PointId;

/// Quality flag carried by incoming telemetry. Producers that do not
/// report quality get `Good`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    #[default]
    Good,
    Suspect,
    Bad,
}

/// One telemetry sample for one point.
///
/// Append-only; ordering is by timestamp but arrival may be out of
/// order or late within the buffer's lateness tolerance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesSample {
    pub point_id: PointId,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub quality: Quality,
}

impl TimeSeriesSample {
    pub fn new(point_id: &str, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            point_id: point_id.to_string(),
            timestamp,
            value,
            quality: Quality::Good,
        }
    }

    /// Bad-quality or non-finite samples never enter the buffer.
    pub fn is_usable(&self) -> bool {
        self.quality != Quality::Bad && self.value.is_finite()
    }
}
