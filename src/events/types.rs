use chrono::{DateTime, Utc};

use crate::ci::{Artifact, BuildInfo};
use crate::pr::{Job, PullKey, PullRequest};

/// Every message that travels on the bus. The set is closed: components
/// match on the variants they care about and ignore the rest.
#[derive(Debug, Clone)]
pub enum Event {
    /// `pull.found`: intake accepted a pull and listed its files
    PullFound(PullRequest),
    /// `pull.validated`: the file rules of the owning project matched
    PullValidated(PullRequest),
    /// `pull.processed`: the idempotency guard decided a build is due
    PullProcessed(ProcessedPull),
    /// `build.started`
    BuildStarted(BuildUpdate),
    /// `build.succeeded`
    BuildSucceeded(BuildUpdate),
    /// `build.failed`
    BuildFailed(BuildUpdate),
    /// `build.aborted`
    BuildAborted(BuildUpdate),
    /// `build.artifact_found`
    ArtifactFound(ArtifactFound),
    /// `pull.inline_status`: one review comment anchored to a diff position
    InlineStatus(InlineComment),
    /// `pull.status`: one plain comment on the pull
    PullStatus(PullComment),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::PullFound(_) => "pull.found",
            Event::PullValidated(_) => "pull.validated",
            Event::PullProcessed(_) => "pull.processed",
            Event::BuildStarted(_) => "build.started",
            Event::BuildSucceeded(_) => "build.succeeded",
            Event::BuildFailed(_) => "build.failed",
            Event::BuildAborted(_) => "build.aborted",
            Event::ArtifactFound(_) => "build.artifact_found",
            Event::InlineStatus(_) => "pull.inline_status",
            Event::PullStatus(_) => "pull.status",
        }
    }
}

/// Why the idempotency guard let a pull through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    NeverBuilt,
    NewCommit,
    /// A retest comment created at this time
    Retest(DateTime<Utc>),
}

#[derive(Debug, Clone)]
pub struct ProcessedPull {
    pub pull: PullRequest,
    pub reason: TriggerReason,
}

impl ProcessedPull {
    /// Watermark to store once the build is triggered: retest comments at or
    /// before it are considered handled.
    pub fn watermark(&self) -> DateTime<Utc> {
        let retest = match self.reason {
            TriggerReason::Retest(at) => Some(at),
            _ => None,
        };
        [Some(self.pull.updated_at), self.pull.skip_comments, retest]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.pull.updated_at)
    }
}

/// A job changed state on the CI server.
#[derive(Debug, Clone)]
pub struct BuildUpdate {
    pub pull: PullKey,
    pub job: Job,
    /// Link shown on the commit status
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactFound {
    pub pull: PullKey,
    /// Commit the build ran against
    pub head_sha: String,
    pub build: BuildInfo,
    pub artifact: Artifact,
}

#[derive(Debug, Clone)]
pub struct InlineComment {
    pub pull: PullKey,
    pub sha: String,
    pub file: String,
    pub position: u64,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct PullComment {
    pub pull: PullKey,
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_watermark_takes_later_of_comment_and_update() {
        let mut pull = crate::testing::pull_request("widgets", 1, "abc");
        pull.updated_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let comment_at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        let retest = ProcessedPull {
            pull: pull.clone(),
            reason: TriggerReason::Retest(comment_at),
        };
        assert_eq!(retest.watermark(), comment_at);

        let commit = ProcessedPull {
            pull: pull.clone(),
            reason: TriggerReason::NewCommit,
        };
        assert_eq!(commit.watermark(), pull.updated_at);

        pull.skip_comments = Some(comment_at);
        let reinjected = ProcessedPull {
            pull,
            reason: TriggerReason::NeverBuilt,
        };
        assert_eq!(reinjected.watermark(), comment_at);
    }
}
