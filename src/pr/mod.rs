pub mod diff;
pub mod types;

pub use types::{DiffRange, FileDiff, Job, JobStatus, PullKey, PullRecord, PullRequest, Violation};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrError {
    #[error("Failed to parse diff: {0}")]
    DiffParse(String),

    #[error("No commit reference in blob URL: {0}")]
    BlobUrl(String),
}

/// Extract the commit reference from a GitHub blob URL
/// (`https://github.com/{owner}/{repo}/blob/{sha}/{path}`).
pub fn parse_blob_sha(blob_url: &str) -> Result<String, PrError> {
    let (_, rest) = blob_url
        .split_once("/blob/")
        .ok_or_else(|| PrError::BlobUrl(blob_url.to_string()))?;
    let sha = rest.split('/').next().unwrap_or_default();
    if sha.is_empty() {
        return Err(PrError::BlobUrl(blob_url.to_string()));
    }
    Ok(sha.to_string())
}

/// Carry already-reported lines from the previous file listing into a
/// recomputed one, matching by filename. Reported sets only grow.
pub fn carry_reported(previous: &[FileDiff], current: &mut [FileDiff]) {
    for file in current.iter_mut() {
        if let Some(old) = previous.iter().find(|old| old.filename == file.filename) {
            file.reported.extend(old.reported.iter().copied());
        }
    }
}
