use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Sample is older than the lateness tolerance relative to the
    /// point's watermark. Counted, not fatal — callers treat this as
    /// a metric, not a failure.
    #[error("late sample dropped for point {point_id}")]
    LateSampleDropped { point_id: String },

    /// Sample carried Bad quality or a non-finite value.
    #[error("unusable sample rejected for point {point_id}")]
    UnusableSample { point_id: String },

    /// The per-point window is full and the sample is older than
    /// everything retained.
    #[error("buffer full for point {point_id}")]
    BufferFull { point_id: String },
}
