use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check failed: someone else wrote first.
    #[error("version conflict on {entity} {id}: expected {expected}, found {found}")]
    VersionConflict {
        entity: &'static str,
        id: String,
        expected: i64,
        found: i64,
    },

    /// Store unreachable; counts toward the engine health threshold.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl StorageError {
    /// Whether a retry at the orchestrator level makes sense.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::VersionConflict { .. }
                | StorageError::Unavailable(_)
                | StorageError::Database(_)
        )
    }
}
