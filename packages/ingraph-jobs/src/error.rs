//! Error types for the Job State Store.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, JobsError>;

#[derive(Debug, Error)]
pub enum JobsError {
    #[error("job already exists: {0}")]
    Conflict(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("version conflict updating job {job_id} (expected {expected}, found {found})")]
    VersionConflict {
        job_id: String,
        expected: u64,
        found: u64,
    },

    #[error("update exhausted {attempts} compare-and-swap retries for job {job_id}")]
    UpdateConflictExhausted { job_id: String, attempts: u32 },

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl JobsError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for JobsError {
    fn from(err: sqlx::Error) -> Self {
        JobsError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for JobsError {
    fn from(err: serde_json::Error) -> Self {
        JobsError::Serialization(err.to_string())
    }
}
