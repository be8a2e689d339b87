pub mod phpcs;
pub mod phpunit;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, instrument, warn};

use crate::ci::{BuildInfo, CiError};
use crate::context::Context;
use crate::events::{ArtifactFound, Event, InlineComment, PullComment};
use crate::pr::{PullKey, PullRecord};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("Malformed artifact for {reporter}: {reason}")]
    Malformed { reporter: String, reason: String },

    #[error(transparent)]
    Ci(#[from] CiError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A finding placed on a diff position, ready to become a review comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedViolation {
    pub file: String,
    /// Commit the comment is anchored to
    pub sha: String,
    /// New-file line, recorded as reported once published
    pub line: u64,
    pub position: u64,
    pub message: String,
}

/// What one reporter wants said about a build.
#[derive(Debug, Default)]
pub struct Report {
    pub inline: Vec<PlacedViolation>,
    pub summary: Option<String>,
}

/// Turns one kind of build artifact into pull request feedback.
#[async_trait]
pub trait Reporter: Send + Sync {
    fn name(&self) -> &str;

    /// Relative path of the artifact this reporter consumes.
    fn artifact_path(&self) -> &str;

    /// Build the report for `artifact` against the stored pull. Must not
    /// touch the store or the bus; the hub publishes.
    async fn report(
        &self,
        build: &BuildInfo,
        record: &PullRecord,
        artifact: &str,
    ) -> Result<Report, ReporterError>;
}

/// Routes `build.artifact_found` to the reporters that consume the artifact
/// and publishes what they produce.
#[derive(Clone)]
pub struct ReporterHub {
    ctx: Context,
    reporters: std::sync::Arc<Vec<Box<dyn Reporter>>>,
}

impl ReporterHub {
    pub fn new(ctx: Context, reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self {
            ctx,
            reporters: std::sync::Arc::new(reporters),
        }
    }

    /// The reporters enabled in configuration.
    pub fn from_config(ctx: Context) -> Self {
        let config = &ctx.config.reporters;
        let mut reporters: Vec<Box<dyn Reporter>> = Vec::new();
        if config.phpcs.enabled {
            reporters.push(Box::new(phpcs::PhpCsReporter::new(&config.phpcs)));
        }
        if config.phpunit.enabled {
            reporters.push(Box::new(phpunit::PhpUnitReporter::new(&config.phpunit)));
        }
        info!(count = reporters.len(), "reporters enabled");
        Self::new(ctx, reporters)
    }

    pub async fn run(self, mut events: broadcast::Receiver<Event>) -> Result<(), StoreError> {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "reporters fell behind the event bus");
                    continue;
                }
                Err(RecvError::Closed) => return Ok(()),
            };
            if let Err(err) = self.handle(event).await {
                error!(error = %err, "store failure while reporting");
                return Err(err);
            }
        }
    }

    /// Handle one event. Artifact and reporter failures are logged; only
    /// store failures are returned.
    pub async fn handle(&self, event: Event) -> Result<(), StoreError> {
        let Event::ArtifactFound(found) = event else {
            return Ok(());
        };
        match self.on_artifact(&found).await {
            Ok(()) => Ok(()),
            Err(ReporterError::Store(err)) => Err(err),
            Err(err) => {
                warn!(pull = %found.pull, artifact = %found.artifact.relative_path, error = %err, "artifact not reported");
                Ok(())
            }
        }
    }

    #[instrument(skip(self, found), fields(pull = %found.pull, build = found.build.number))]
    async fn on_artifact(&self, found: &ArtifactFound) -> Result<(), ReporterError> {
        let consumers: Vec<&dyn Reporter> = self
            .reporters
            .iter()
            .map(|reporter| reporter.as_ref())
            .filter(|reporter| reporter.artifact_path() == found.artifact.relative_path)
            .collect();
        if consumers.is_empty() {
            debug!(artifact = %found.artifact.relative_path, "no reporter for artifact");
            return Ok(());
        }

        let body = self.ctx.ci.fetch_artifact(&found.artifact.url).await?;
        let Some(mut record) = self.ctx.store.find_pull(&found.pull)? else {
            warn!("artifact for an unknown pull");
            return Ok(());
        };
        // Findings only map onto the diff of the commit that was built.
        let listed = record.files.len();
        record.files.retain(|file| file.sha == found.head_sha);
        if record.files.len() < listed {
            info!(
                built = %found.head_sha,
                skipped = listed - record.files.len(),
                "pull moved past the built commit; skipping its newer files"
            );
        }

        for reporter in consumers {
            match reporter.report(&found.build, &record, &body).await {
                Ok(report) => self.publish(&found.pull, report)?,
                Err(ReporterError::Store(err)) => return Err(err.into()),
                Err(err) => warn!(reporter = reporter.name(), error = %err, "reporter failed"),
            }
        }
        Ok(())
    }

    /// Record each line as reported before announcing it, so a restart never
    /// repeats a comment.
    fn publish(&self, key: &PullKey, report: Report) -> Result<(), StoreError> {
        let mut published = 0;
        for violation in report.inline {
            if !self.ctx.store.mark_reported(key, &violation.file, violation.line)? {
                continue;
            }
            self.ctx.bus.publish(Event::InlineStatus(InlineComment {
                pull: key.clone(),
                sha: violation.sha,
                file: violation.file,
                position: violation.position,
                body: violation.message,
            }));
            published += 1;
        }
        if let Some(body) = report.summary {
            self.ctx.bus.publish(Event::PullStatus(PullComment {
                pull: key.clone(),
                body,
            }));
        }
        debug!(inline = published, "report published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{drain, file_diff, harness, pull_record};

    struct FixedReporter;

    #[async_trait]
    impl Reporter for FixedReporter {
        fn name(&self) -> &str {
            "fixed"
        }

        fn artifact_path(&self) -> &str {
            "artifacts/fixed.txt"
        }

        async fn report(
            &self,
            _build: &BuildInfo,
            record: &PullRecord,
            artifact: &str,
        ) -> Result<Report, ReporterError> {
            Ok(Report {
                inline: record
                    .files
                    .iter()
                    .map(|file| PlacedViolation {
                        file: file.filename.clone(),
                        sha: file.sha.clone(),
                        line: 2,
                        position: 2,
                        message: artifact.to_string(),
                    })
                    .collect(),
                summary: Some("done".to_string()),
            })
        }
    }

    fn found(number: u64, path: &str) -> Event {
        found_at(number, "abc", path)
    }

    fn found_at(number: u64, head_sha: &str, path: &str) -> Event {
        Event::ArtifactFound(ArtifactFound {
            pull: PullKey::new("widgets", number),
            head_sha: head_sha.to_string(),
            build: crate::testing::build_info("job", number, Some("SUCCESS")),
            artifact: crate::ci::Artifact {
                file_name: path.rsplit('/').next().unwrap_or(path).to_string(),
                relative_path: path.to_string(),
                url: format!("http://ci/job/widgets-build/{number}/artifact/{path}"),
            },
        })
    }

    fn seeded() -> (crate::testing::Harness, ReporterHub) {
        let h = harness();
        let mut record = pull_record("widgets", 5);
        record.files = vec![file_diff("src/a.php", "@@ -1,1 +1,2 @@\n a\n+b")];
        h.ctx.store.insert_pull(&record).unwrap();
        h.ci.add_artifact(5, "artifacts/fixed.txt", "trailing whitespace");
        let hub = ReporterHub::new(h.ctx.clone(), vec![Box::new(FixedReporter)]);
        (h, hub)
    }

    #[tokio::test]
    async fn test_inline_comment_published_once() {
        let (h, hub) = seeded();
        let mut rx = h.ctx.bus.subscribe();

        hub.handle(found(5, "artifacts/fixed.txt")).await.unwrap();
        hub.handle(found(5, "artifacts/fixed.txt")).await.unwrap();

        let kinds: Vec<_> = drain(&mut rx).iter().map(Event::kind).collect();
        assert_eq!(
            kinds,
            vec!["pull.inline_status", "pull.status", "pull.status"]
        );
        let record = h.ctx.store.find_pull(&PullKey::new("widgets", 5)).unwrap().unwrap();
        assert!(record.files[0].reported.contains(&2));
    }

    #[tokio::test]
    async fn test_unclaimed_artifact_is_not_fetched() {
        let (h, hub) = seeded();
        hub.handle(found(5, "artifacts/other.log")).await.unwrap();
        assert_eq!(h.ci.calls("fetch_artifact"), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_logged_not_fatal() {
        let (h, hub) = seeded();
        let mut rx = h.ctx.bus.subscribe();
        hub.handle(found(6, "artifacts/fixed.txt")).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_findings_for_an_older_commit_are_not_placed() {
        let (h, hub) = seeded();
        let mut rx = h.ctx.bus.subscribe();

        hub.handle(found_at(5, "0ld", "artifacts/fixed.txt")).await.unwrap();

        let kinds: Vec<_> = drain(&mut rx).iter().map(Event::kind).collect();
        assert_eq!(kinds, vec!["pull.status"]);
        let record = h.ctx.store.find_pull(&PullKey::new("widgets", 5)).unwrap().unwrap();
        assert!(record.files[0].reported.is_empty());
    }
}
