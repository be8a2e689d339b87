pub mod client;

pub use client::GitHubClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::pr::PullRequest;

#[derive(Debug, Error)]
pub enum ScmError {
    #[error("GitHub API request failed: {0}")]
    ApiRequest(#[from] reqwest::Error),

    #[error("GitHub resource not found: {0}")]
    NotFound(String),
}

/// Commit status states understood by GitHub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
            CommitState::Error => "error",
        }
    }
}

/// The source-control operations the orchestrator needs.
/// Implemented over the GitHub REST API; tests use an in-memory fake.
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn list_open_pulls(&self, repo: &str) -> Result<Vec<GhPull>, ScmError>;

    async fn get_pull(&self, repo: &str, number: u64) -> Result<GhPull, ScmError>;

    async fn get_files(&self, repo: &str, number: u64) -> Result<Vec<ChangedFile>, ScmError>;

    async fn get_issue_comments(&self, repo: &str, number: u64)
        -> Result<Vec<IssueComment>, ScmError>;

    async fn create_comment(&self, repo: &str, number: u64, body: &str) -> Result<(), ScmError>;

    async fn create_inline_comment(
        &self,
        repo: &str,
        number: u64,
        sha: &str,
        file: &str,
        position: u64,
        body: &str,
    ) -> Result<(), ScmError>;

    async fn set_commit_status(
        &self,
        repo: &str,
        sha: &str,
        state: CommitState,
        target_url: &str,
        description: &str,
    ) -> Result<(), ScmError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhUser {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhRepository {
    pub name: String,
    #[serde(default)]
    pub ssh_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhHead {
    pub sha: String,
    pub label: String,
    /// Absent when the head repository was deleted
    pub repo: Option<GhRepository>,
}

/// A pull request as returned by the REST API and embedded in webhooks.
#[derive(Debug, Clone, Deserialize)]
pub struct GhPull {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    pub body: Option<String>,
    pub user: GhUser,
    pub head: GhHead,
    #[serde(default)]
    pub mergeable: Option<bool>,
    /// `open` or `closed`
    #[serde(default)]
    pub state: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GhPull {
    /// Normalize into the orchestrator's view; files are listed separately.
    pub fn into_pull_request(self, repo: &str) -> PullRequest {
        let head_clone_url = self
            .head
            .repo
            .and_then(|r| r.ssh_url)
            .unwrap_or_default();
        PullRequest {
            repo: repo.to_string(),
            number: self.number,
            title: self.title,
            body: self.body.unwrap_or_default(),
            author: self.user.login,
            head_sha: self.head.sha,
            head_label: self.head.label,
            head_clone_url,
            mergeable: self.mergeable,
            created_at: self.created_at,
            updated_at: self.updated_at,
            files: Vec::new(),
            skip_comments: None,
        }
    }
}

/// One entry of the pull files listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangedFile {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub status: String,
    /// Absent for binary files and oversized diffs
    pub patch: Option<String>,
    pub blob_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueComment {
    #[serde(default)]
    pub body: String,
    pub user: GhUser,
    pub created_at: DateTime<Utc>,
}

/// Payload of a `pull_request` webhook delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    pub action: Option<String>,
    pub pull_request: GhPull,
    pub repository: GhRepository,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhIssue {
    pub number: u64,
    /// Present only when the issue is a pull request
    pub pull_request: Option<serde_json::Value>,
}

/// Payload of an `issue_comment` webhook delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueCommentEvent {
    pub action: Option<String>,
    pub issue: GhIssue,
    pub comment: IssueComment,
    pub repository: GhRepository,
}
