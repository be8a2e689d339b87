pub mod jenkins;

pub use jenkins::JenkinsClient;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Build parameter carrying the job's correlation token.
pub const CORRELATION_PARAM: &str = "JOB";

#[derive(Debug, Error)]
pub enum CiError {
    #[error("CI request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid CI URL: {0}")]
    InvalidUrl(String),

    #[error("CI server rejected the request with status {status}")]
    Rejected { status: u16 },
}

/// Parameters of one build trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerParams {
    /// Correlation token, read back from the build's parameters when polling
    pub job_id: String,
    pub pull_number: u64,
    pub repository_url: String,
    pub branch: String,
    /// Remote trigger token for the project
    pub token: Option<String>,
}

/// A build as listed by the CI server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub number: u64,
    pub url: String,
    pub building: bool,
    /// Remote result code (`SUCCESS`, `FAILURE`, ...); `None` while running
    pub result: Option<String>,
    pub parameters: Vec<(String, String)>,
}

/// What a remote build's state means for the job it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl BuildInfo {
    pub fn correlation_token(&self) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(name, _)| name == CORRELATION_PARAM)
            .map(|(_, value)| value.as_str())
    }

    pub fn outcome(&self) -> BuildOutcome {
        if self.building {
            return BuildOutcome::Running;
        }
        match self.result.as_deref() {
            None => BuildOutcome::Running,
            Some("SUCCESS") => BuildOutcome::Succeeded,
            Some("FAILURE") | Some("UNSTABLE") => BuildOutcome::Failed,
            Some(_) => BuildOutcome::Aborted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub file_name: String,
    pub relative_path: String,
    /// Download URL; filled in from the build URL after listing
    #[serde(default)]
    pub url: String,
}

/// The CI server operations the orchestrator needs.
#[async_trait]
pub trait CiServer: Send + Sync {
    async fn trigger_build(&self, project: &str, params: &TriggerParams) -> Result<(), CiError>;

    async fn list_builds(&self, project: &str) -> Result<Vec<BuildInfo>, CiError>;

    async fn list_artifacts(&self, project: &str, build: &BuildInfo)
        -> Result<Vec<Artifact>, CiError>;

    async fn fetch_artifact(&self, url: &str) -> Result<String, CiError>;
}
