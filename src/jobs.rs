use std::collections::HashMap;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, instrument, warn};

use crate::ci::{BuildInfo, BuildOutcome, TriggerParams};
use crate::context::Context;
use crate::events::{ArtifactFound, BuildUpdate, Event, ProcessedPull, TriggerReason};
use crate::github::ScmError;
use crate::intake::{qualifies_as_retest, Intake, IntakeError, RawEvent};
use crate::pr::{Job, JobStatus, PullKey, PullRecord, PullRequest};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scm(#[from] ScmError),
}

/// Drives pulls from `pull.found` to a triggered build, and builds from
/// `new` to a terminal state.
#[derive(Clone)]
pub struct JobManager {
    ctx: Context,
}

impl JobManager {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Consume bus events until the bus closes. Returns early only when the
    /// store fails.
    pub async fn run(self, mut events: broadcast::Receiver<Event>) -> Result<(), StoreError> {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "job manager fell behind the event bus");
                    continue;
                }
                Err(RecvError::Closed) => return Ok(()),
            };
            let kind = event.kind();
            match self.handle(event).await {
                Ok(()) => {}
                Err(JobError::Store(err)) => {
                    error!(error = %err, event = kind, "store failure");
                    return Err(err);
                }
                Err(err) => warn!(error = %err, event = kind, "event handling failed"),
            }
        }
    }

    pub async fn handle(&self, event: Event) -> Result<(), JobError> {
        match event {
            Event::PullFound(pull) => {
                self.validate(pull);
                Ok(())
            }
            Event::PullValidated(pull) => self.process_pull(pull).await.map(|_| ()),
            Event::PullProcessed(processed) => self.trigger(processed).await.map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Emit `pull.validated` when the repository maps to a CI project whose
    /// rules match one of the changed files.
    #[instrument(skip(self, pull), fields(pull = %pull.key()))]
    pub fn validate(&self, pull: PullRequest) -> bool {
        let Some(project) = self.ctx.config.resolve_project(&pull.repo) else {
            warn!("no CI project configured for repository");
            return false;
        };
        if !project.rules.matches(&pull.filenames()) {
            debug!(project = %project.name, "no changed file matches the project rules");
            return false;
        }
        self.ctx.bus.publish(Event::PullValidated(pull));
        true
    }

    /// Persist the pull and decide whether it needs a build. Emits
    /// `pull.processed` with the reason when it does.
    #[instrument(skip(self, pull), fields(pull = %pull.key(), head = %pull.head_sha))]
    pub async fn process_pull(
        &self,
        pull: PullRequest,
    ) -> Result<Option<TriggerReason>, JobError> {
        let key = pull.key();
        let store = &self.ctx.store;

        let reason = match store.find_pull(&key)? {
            None => {
                store.insert_pull(&PullRecord {
                    repo: pull.repo.clone(),
                    number: pull.number,
                    head_sha: None,
                    created_at: pull.created_at,
                    updated_at: pull.updated_at,
                    files: pull.files.clone(),
                    jobs: Vec::new(),
                })?;
                Some(TriggerReason::NeverBuilt)
            }
            Some(record) => {
                store.update_files(&key, &pull.files)?;
                match record.head_sha.as_deref() {
                    None => Some(TriggerReason::NeverBuilt),
                    Some(built) if built != pull.head_sha => Some(TriggerReason::NewCommit),
                    Some(_) => match pull.skip_comments {
                        Some(at) => Some(TriggerReason::Retest(at)),
                        None => self.find_retest(&pull, &record).await?,
                    },
                }
            }
        };

        match reason {
            Some(reason) => {
                debug!(?reason, "pull needs a build");
                self.ctx.bus.publish(Event::PullProcessed(ProcessedPull {
                    pull,
                    reason,
                }));
            }
            None => debug!("pull is up to date"),
        }
        Ok(reason)
    }

    /// Scan the pull's comments for a qualifying retest request newer than
    /// the stored watermark. The latest one wins so the watermark covers all.
    async fn find_retest(
        &self,
        pull: &PullRequest,
        record: &PullRecord,
    ) -> Result<Option<TriggerReason>, JobError> {
        let github = &self.ctx.config.github;
        let comments = self.ctx.scm.get_issue_comments(&pull.repo, pull.number).await?;
        Ok(comments
            .iter()
            .filter(|comment| {
                qualifies_as_retest(
                    comment,
                    &github.bot_handle,
                    &github.retry_whitelist,
                    &pull.author,
                    Some(record.updated_at),
                )
            })
            .map(|comment| comment.created_at)
            .max()
            .map(TriggerReason::Retest))
    }

    /// Create a job and trigger its build. A pull with an outstanding job is
    /// left alone; it is looked at again once that job ends.
    #[instrument(skip(self, processed), fields(pull = %processed.pull.key(), reason = ?processed.reason))]
    pub async fn trigger(&self, processed: ProcessedPull) -> Result<Option<Job>, JobError> {
        let pull = &processed.pull;
        let key = pull.key();
        let store = &self.ctx.store;

        let Some(project) = self.ctx.config.resolve_project(&pull.repo) else {
            warn!("no CI project configured for repository");
            return Ok(None);
        };

        let job = Job::new(pull.number, pull.head_sha.clone());
        if !store.begin_job(&key, &job)? {
            info!("a build is already outstanding; deferring");
            return Ok(None);
        }

        let params = TriggerParams {
            job_id: job.id.clone(),
            pull_number: pull.number,
            repository_url: pull.head_clone_url.clone(),
            branch: pull.branch(),
            token: project.token.clone(),
        };
        if let Err(err) = self.ctx.ci.trigger_build(&project.name, &params).await {
            warn!(error = %err, job = %job.id, "build trigger failed; will retry on next sighting");
            store.transition_job(&job.id, JobStatus::New, JobStatus::Aborted)?;
            return Ok(None);
        }

        store.record_build(&key, &pull.head_sha, processed.watermark())?;
        info!(job = %job.id, project = %project.name, "build triggered");
        Ok(Some(job))
    }

    /// One reconciliation pass over every pull with an outstanding job.
    /// Build listings are fetched once per project per pass. CI failures are
    /// logged and retried next pass; only store failures are returned.
    pub async fn poll(&self) -> Result<(), StoreError> {
        let pulls = self.ctx.store.pulls_with_outstanding_jobs()?;
        let mut listings: HashMap<String, Option<Vec<BuildInfo>>> = HashMap::new();

        for record in pulls {
            let Some(job) = record.outstanding_job().cloned() else {
                continue;
            };
            let key = record.key();
            let Some(project) = self.ctx.config.resolve_project(&record.repo) else {
                warn!(pull = %key, "no CI project configured for repository");
                continue;
            };

            if !listings.contains_key(&project.name) {
                let builds = match self.ctx.ci.list_builds(&project.name).await {
                    Ok(builds) => Some(builds),
                    Err(err) => {
                        warn!(project = %project.name, error = %err, "failed to list builds");
                        None
                    }
                };
                listings.insert(project.name.clone(), builds);
            }
            let Some(Some(builds)) = listings.get(&project.name) else {
                continue;
            };

            match builds
                .iter()
                .find(|build| build.correlation_token() == Some(job.id.as_str()))
            {
                Some(build) => self.reconcile(&key, &project.name, &job, build).await?,
                None if job.status == JobStatus::New
                    && Utc::now() - job.created_at >= self.ctx.config.pending_timeout() =>
                {
                    self.abandon(&key, &job).await?
                }
                None => debug!(pull = %key, job = %job.id, "build not listed yet"),
            }
        }
        Ok(())
    }

    /// Apply one observed remote build state to its job. Every transition is
    /// a compare-and-set, so overlapping passes emit each event once.
    #[instrument(skip(self, job, build), fields(pull = %key, job = %job.id, build = build.number))]
    async fn reconcile(
        &self,
        key: &PullKey,
        project: &str,
        job: &Job,
        build: &BuildInfo,
    ) -> Result<(), StoreError> {
        let store = &self.ctx.store;
        let update = |status: JobStatus, url: String| BuildUpdate {
            pull: key.clone(),
            job: Job {
                status,
                ..job.clone()
            },
            url,
        };

        if job.status == JobStatus::New
            && store.transition_job(&job.id, JobStatus::New, JobStatus::Started)?
        {
            info!("build started");
            self.ctx
                .bus
                .publish(Event::BuildStarted(update(JobStatus::Started, build.url.clone())));
        }

        match build.outcome() {
            BuildOutcome::Running => {}
            BuildOutcome::Succeeded => {
                if store.transition_job(&job.id, JobStatus::Started, JobStatus::Finished)? {
                    info!("build succeeded");
                    self.ctx
                        .bus
                        .publish(Event::BuildSucceeded(update(JobStatus::Finished, build.url.clone())));
                    self.publish_artifacts(key, job, project, build).await;
                    self.resight(key).await?;
                }
            }
            BuildOutcome::Failed => {
                if store.transition_job(&job.id, JobStatus::Started, JobStatus::Finished)? {
                    info!(result = ?build.result, "build failed");
                    let console = format!("{}console", build.url);
                    self.ctx
                        .bus
                        .publish(Event::BuildFailed(update(JobStatus::Finished, console)));
                    self.publish_artifacts(key, job, project, build).await;
                    self.resight(key).await?;
                }
            }
            BuildOutcome::Aborted => {
                if store.transition_job(&job.id, JobStatus::Started, JobStatus::Aborted)? {
                    info!(result = ?build.result, "build aborted");
                    self.ctx
                        .bus
                        .publish(Event::BuildAborted(update(JobStatus::Aborted, build.url.clone())));
                    self.resight(key).await?;
                }
            }
        }
        Ok(())
    }

    /// Give up on a job whose build never showed up on the CI server and
    /// make the pull buildable again.
    async fn abandon(&self, key: &PullKey, job: &Job) -> Result<(), StoreError> {
        let store = &self.ctx.store;
        if !store.transition_job(&job.id, JobStatus::New, JobStatus::Aborted)? {
            return Ok(());
        }
        warn!(pull = %key, job = %job.id, "build never appeared on the CI server; abandoning job");
        store.forget_build(key, &job.head_sha)?;
        self.resight(key).await
    }

    /// Run the pull through intake again once its job has ended. Pushes and
    /// retest requests refused while the job was outstanding are picked up
    /// here; webhooks deliver them only once.
    async fn resight(&self, key: &PullKey) -> Result<(), StoreError> {
        let pull = match self.ctx.scm.get_pull(&key.repo, key.number).await {
            Ok(pull) => pull,
            Err(err) => {
                warn!(pull = %key, error = %err, "failed to re-read pull");
                return Ok(());
            }
        };
        if pull.state.as_deref() == Some("closed") {
            debug!(pull = %key, "pull closed; not looking again");
            return Ok(());
        }
        let event = RawEvent::Polled {
            repo: key.repo.clone(),
            pull,
        };
        match Intake::new(self.ctx.clone()).handle(event).await {
            Ok(_) => Ok(()),
            Err(IntakeError::Store(err)) => Err(err),
            Err(err) => {
                warn!(pull = %key, error = %err, "failed to re-read pull");
                Ok(())
            }
        }
    }

    async fn publish_artifacts(&self, key: &PullKey, job: &Job, project: &str, build: &BuildInfo) {
        let artifacts = match self.ctx.ci.list_artifacts(project, build).await {
            Ok(artifacts) => artifacts,
            Err(err) => {
                warn!(error = %err, "failed to list build artifacts");
                return;
            }
        };
        for artifact in artifacts {
            debug!(artifact = %artifact.file_name, path = %artifact.relative_path, "artifact found");
            self.ctx.bus.publish(Event::ArtifactFound(ArtifactFound {
                pull: key.clone(),
                head_sha: job.head_sha.clone(),
                build: build.clone(),
                artifact,
            }));
        }
    }
}
