use thiserror::Error;

#[derive(Error, Debug)]
pub enum RulesError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Topology graph query failed; the expansion is retried.
    #[error("topology query failed: {0}")]
    Topology(String),

    #[error("store error: {0}")]
    Store(#[from] faultline_storage::StorageError),

    /// Expansion retries exhausted.
    #[error("expansion failed for template {template_id} after {attempts} attempts: {reason}")]
    ExpansionFailed {
        template_id: String,
        attempts: u32,
        reason: String,
    },
}
