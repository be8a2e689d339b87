pub mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::pr::{FileDiff, Job, JobStatus, PullKey, PullRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode or decode files: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store connection lock poisoned")]
    Poisoned,
}

/// Durable record of pulls and their jobs. The single source of truth for
/// what has already been acted upon.
///
/// Implementations serialize writes; the check-and-write operations
/// (`begin_job`, `transition_job`, `mark_reported`, `update_files`) are atomic.
pub trait PullStore: Send + Sync {
    fn find_pull(&self, key: &PullKey) -> Result<Option<PullRecord>, StoreError>;

    /// Insert a newly sighted pull. Returns false if it already existed.
    fn insert_pull(&self, record: &PullRecord) -> Result<bool, StoreError>;

    /// Replace the file listing, carrying reported lines forward by filename.
    fn update_files(&self, key: &PullKey, files: &[FileDiff]) -> Result<(), StoreError>;

    /// Insert `job` unless the pull already has a non-terminal job.
    /// Returns whether the job was inserted.
    fn begin_job(&self, key: &PullKey, job: &Job) -> Result<bool, StoreError>;

    /// Record that a build for `head_sha` was triggered and advance the
    /// retest watermark.
    fn record_build(
        &self,
        key: &PullKey,
        head_sha: &str,
        watermark: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Undo `record_build` for a build that never ran, so the pull is
    /// considered unbuilt again. Only clears the SHA if it is still `head_sha`.
    fn forget_build(&self, key: &PullKey, head_sha: &str) -> Result<bool, StoreError>;

    /// Move a job from `from` to `to`. Returns false when the job is not in
    /// `from` (another poll got there first) or the transition is illegal.
    fn transition_job(&self, job_id: &str, from: JobStatus, to: JobStatus)
        -> Result<bool, StoreError>;

    fn pulls_with_outstanding_jobs(&self) -> Result<Vec<PullRecord>, StoreError>;

    /// Add `line` to the reported set of `filename`. Returns false when it
    /// was already reported or the file is unknown.
    fn mark_reported(&self, key: &PullKey, filename: &str, line: u64) -> Result<bool, StoreError>;
}
