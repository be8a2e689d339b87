use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identity of a pull request: (repository, number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PullKey {
    pub repo: String,
    pub number: u64,
}

impl PullKey {
    pub fn new(repo: impl Into<String>, number: u64) -> Self {
        Self {
            repo: repo.into(),
            number,
        }
    }
}

impl std::fmt::Display for PullKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

/// Live snapshot of a pull request as seen by intake.
/// Built from the GitHub API response plus the per-file diff ranges.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub repo: String,
    pub number: u64,
    pub title: String,
    /// Pull description, scanned for the ignore directive
    pub body: String,
    /// Author's GitHub login
    pub author: String,
    pub head_sha: String,
    /// Head label in `owner:branch` form
    pub head_label: String,
    /// Clone URL of the head repository
    pub head_clone_url: String,
    /// `None` while GitHub is still computing mergeability
    pub mergeable: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub files: Vec<FileDiff>,
    /// Set when a retest comment re-injected this pull: the comment's timestamp.
    /// Such pulls bypass the comment scan.
    pub skip_comments: Option<DateTime<Utc>>,
}

impl PullRequest {
    pub fn key(&self) -> PullKey {
        PullKey::new(self.repo.clone(), self.number)
    }

    /// Branch name as the CI server expects it (`origin/<branch>`).
    pub fn branch(&self) -> String {
        let branch = self
            .head_label
            .split_once(':')
            .map_or(self.head_label.as_str(), |(_, branch)| branch);
        format!("origin/{branch}")
    }

    pub fn filenames(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.filename.as_str()).collect()
    }
}

/// A single changed file with its addressable diff ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub filename: String,
    /// Commit the file blob was read at; used to anchor inline comments
    pub sha: String,
    /// GitHub change status: added, modified, removed, renamed, ...
    pub status: String,
    pub ranges: Vec<DiffRange>,
    /// New-file line numbers already commented on. Only ever grows.
    #[serde(default)]
    pub reported: BTreeSet<u64>,
}

/// One hunk of a unified diff in new-file coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRange {
    /// First new-file line covered by the hunk
    pub start: u64,
    /// One past the last new-file line covered by the hunk
    pub end: u64,
    /// Rendered length of the hunk: header + declared lines + deletions
    pub length: u64,
    /// Sum of the rendered lengths of all prior hunks
    pub offset: u64,
    /// Running new-file line at which each deletion was seen
    pub deletions: Vec<u64>,
}

/// Lifecycle of a build job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    New,
    Started,
    Finished,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Aborted)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::New, JobStatus::Started)
                | (JobStatus::New, JobStatus::Aborted)
                | (JobStatus::Started, JobStatus::Finished)
                | (JobStatus::Started, JobStatus::Aborted)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(JobStatus::New),
            "started" => Ok(JobStatus::Started),
            "finished" => Ok(JobStatus::Finished),
            "aborted" => Ok(JobStatus::Aborted),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// One CI build triggered for a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Correlation token passed to the CI server as the `JOB` parameter
    pub id: String,
    pub pull_number: u64,
    pub head_sha: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(pull_number: u64, head_sha: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pull_number,
            head_sha: head_sha.into(),
            status: JobStatus::New,
            created_at: Utc::now(),
        }
    }
}

/// Persisted view of a pull request.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRecord {
    pub repo: String,
    pub number: u64,
    /// Head SHA of the last successfully triggered build
    pub head_sha: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Watermark: retest comments created after this are new
    pub updated_at: DateTime<Utc>,
    pub files: Vec<FileDiff>,
    pub jobs: Vec<Job>,
}

impl PullRecord {
    pub fn key(&self) -> PullKey {
        PullKey::new(self.repo.clone(), self.number)
    }

    pub fn outstanding_job(&self) -> Option<&Job> {
        self.jobs.iter().find(|job| !job.status.is_terminal())
    }
}

/// A static-analysis finding in new-file coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub file: String,
    pub line: u64,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            JobStatus::New,
            JobStatus::Started,
            JobStatus::Finished,
            JobStatus::Aborted,
        ];
        for terminal in [JobStatus::Finished, JobStatus::Aborted] {
            assert!(terminal.is_terminal());
            for next in all {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_started_never_reentered() {
        assert!(JobStatus::New.can_transition_to(JobStatus::Started));
        assert!(!JobStatus::Started.can_transition_to(JobStatus::Started));
        assert!(!JobStatus::Started.can_transition_to(JobStatus::New));
    }

    #[test]
    fn test_job_status_round_trips_through_str() {
        for status in [JobStatus::New, JobStatus::Started, JobStatus::Finished, JobStatus::Aborted] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("building".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_new_jobs_get_distinct_ids() {
        let a = Job::new(1, "abc");
        let b = Job::new(1, "abc");
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, JobStatus::New);
    }

    #[test]
    fn test_branch_strips_owner_from_label() {
        let pull = crate::testing::pull_request("widgets", 7, "abc");
        assert_eq!(pull.branch(), "origin/feature");
    }

    #[test]
    fn test_pull_key_display() {
        assert_eq!(PullKey::new("widgets", 42).to_string(), "widgets#42");
    }
}
