use thiserror::Error;

use faultline_rules::RulesError;
use faultline_storage::StorageError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StorageError),

    #[error("rules error: {0}")]
    Rules(#[from] RulesError),

    /// The worker pool could not be acquired within the dispatch
    /// timeout; the request should be re-queued.
    #[error("worker pool busy")]
    Busy,

    /// Too many consecutive store failures; evaluation is suspended
    /// until a write succeeds again.
    #[error("store unhealthy, evaluation suspended")]
    Unhealthy,

    /// Shutdown began mid-step; the step was abandoned before
    /// persisting and is safe to retry.
    #[error("step cancelled before persistence")]
    Cancelled,
}

impl EngineError {
    /// Whether the orchestrator should retry the request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Busy | EngineError::Unhealthy | EngineError::Cancelled => true,
            EngineError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}
