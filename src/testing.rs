//! In-memory fakes and fixtures shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::ci::{Artifact, BuildInfo, CiError, CiServer, TriggerParams, CORRELATION_PARAM};
use crate::config::{CiConfig, Config, GitHubConfig};
use crate::context::Context;
use crate::events::Event;
use crate::github::{
    ChangedFile, CommitState, GhHead, GhPull, GhRepository, GhUser, IssueComment, ScmError,
    SourceControl,
};
use crate::intake::Intake;
use crate::jobs::JobManager;
use crate::notify::Notifier;
use crate::pr::{diff, FileDiff, PullRecord, PullRequest};
use crate::reporters::ReporterHub;
use crate::store::SqliteStore;

type PullId = (String, u64);

#[derive(Debug, Clone, PartialEq)]
pub struct PostedStatus {
    pub repo: String,
    pub sha: String,
    pub state: CommitState,
    pub target_url: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostedInline {
    pub number: u64,
    pub sha: String,
    pub file: String,
    pub position: u64,
    pub body: String,
}

#[derive(Default)]
pub struct FakeScm {
    pulls: Mutex<HashMap<PullId, GhPull>>,
    files: Mutex<HashMap<PullId, Vec<ChangedFile>>>,
    comments: Mutex<HashMap<PullId, Vec<IssueComment>>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    statuses: Mutex<Vec<PostedStatus>>,
    inline: Mutex<Vec<PostedInline>>,
    posted: Mutex<Vec<(u64, String)>>,
}

impl FakeScm {
    pub fn add_pull(&self, repo: &str, pull: GhPull) {
        self.pulls
            .lock()
            .unwrap()
            .insert((repo.to_string(), pull.number), pull);
    }

    pub fn set_files(&self, repo: &str, number: u64, files: Vec<ChangedFile>) {
        self.files
            .lock()
            .unwrap()
            .insert((repo.to_string(), number), files);
    }

    pub fn set_comments(&self, repo: &str, number: u64, comments: Vec<IssueComment>) {
        self.comments
            .lock()
            .unwrap()
            .insert((repo.to_string(), number), comments);
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn statuses(&self) -> Vec<PostedStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn inline_comments(&self) -> Vec<PostedInline> {
        self.inline.lock().unwrap().clone()
    }

    pub fn posted_comments(&self) -> Vec<(u64, String)> {
        self.posted.lock().unwrap().clone()
    }

    fn count(&self, name: &'static str) {
        *self.calls.lock().unwrap().entry(name).or_default() += 1;
    }
}

#[async_trait]
impl SourceControl for FakeScm {
    async fn list_open_pulls(&self, repo: &str) -> Result<Vec<GhPull>, ScmError> {
        self.count("list_open_pulls");
        let mut pulls: Vec<GhPull> = self
            .pulls
            .lock()
            .unwrap()
            .iter()
            .filter(|((r, _), _)| r == repo)
            .map(|(_, pull)| pull.clone())
            .collect();
        pulls.sort_by_key(|pull| pull.number);
        Ok(pulls)
    }

    async fn get_pull(&self, repo: &str, number: u64) -> Result<GhPull, ScmError> {
        self.count("get_pull");
        self.pulls
            .lock()
            .unwrap()
            .get(&(repo.to_string(), number))
            .cloned()
            .ok_or_else(|| ScmError::NotFound(format!("{repo}#{number}")))
    }

    async fn get_files(&self, repo: &str, number: u64) -> Result<Vec<ChangedFile>, ScmError> {
        self.count("get_files");
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(&(repo.to_string(), number))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_issue_comments(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<Vec<IssueComment>, ScmError> {
        self.count("get_issue_comments");
        Ok(self
            .comments
            .lock()
            .unwrap()
            .get(&(repo.to_string(), number))
            .cloned()
            .unwrap_or_default())
    }

    async fn create_comment(&self, _repo: &str, number: u64, body: &str) -> Result<(), ScmError> {
        self.count("create_comment");
        self.posted.lock().unwrap().push((number, body.to_string()));
        Ok(())
    }

    async fn create_inline_comment(
        &self,
        _repo: &str,
        number: u64,
        sha: &str,
        file: &str,
        position: u64,
        body: &str,
    ) -> Result<(), ScmError> {
        self.count("create_inline_comment");
        self.inline.lock().unwrap().push(PostedInline {
            number,
            sha: sha.to_string(),
            file: file.to_string(),
            position,
            body: body.to_string(),
        });
        Ok(())
    }

    async fn set_commit_status(
        &self,
        repo: &str,
        sha: &str,
        state: CommitState,
        target_url: &str,
        description: &str,
    ) -> Result<(), ScmError> {
        self.count("set_commit_status");
        self.statuses.lock().unwrap().push(PostedStatus {
            repo: repo.to_string(),
            sha: sha.to_string(),
            state,
            target_url: target_url.to_string(),
            description: description.to_string(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCi {
    triggers: Mutex<Vec<(String, TriggerParams)>>,
    builds: Mutex<HashMap<String, Vec<BuildInfo>>>,
    artifacts: Mutex<HashMap<u64, Vec<Artifact>>>,
    bodies: Mutex<HashMap<String, String>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    reject: Mutex<bool>,
}

impl FakeCi {
    pub fn triggers(&self) -> Vec<(String, TriggerParams)> {
        self.triggers.lock().unwrap().clone()
    }

    pub fn reject_triggers(&self, reject: bool) {
        *self.reject.lock().unwrap() = reject;
    }

    /// Add a build to the project's listing, replacing one with the same number.
    pub fn set_build(&self, project: &str, build: BuildInfo) {
        let mut builds = self.builds.lock().unwrap();
        let listing = builds.entry(project.to_string()).or_default();
        listing.retain(|b| b.number != build.number);
        listing.push(build);
    }

    pub fn add_artifact(&self, build_number: u64, relative_path: &str, body: &str) {
        let url = format!("http://ci/job/widgets-build/{build_number}/artifact/{relative_path}");
        self.artifacts
            .lock()
            .unwrap()
            .entry(build_number)
            .or_default()
            .push(Artifact {
                file_name: relative_path
                    .rsplit('/')
                    .next()
                    .unwrap_or(relative_path)
                    .to_string(),
                relative_path: relative_path.to_string(),
                url: url.clone(),
            });
        self.bodies.lock().unwrap().insert(url, body.to_string());
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    fn count(&self, name: &'static str) {
        *self.calls.lock().unwrap().entry(name).or_default() += 1;
    }
}

#[async_trait]
impl CiServer for FakeCi {
    async fn trigger_build(&self, project: &str, params: &TriggerParams) -> Result<(), CiError> {
        self.count("trigger_build");
        if *self.reject.lock().unwrap() {
            return Err(CiError::Rejected { status: 503 });
        }
        self.triggers
            .lock()
            .unwrap()
            .push((project.to_string(), params.clone()));
        Ok(())
    }

    async fn list_builds(&self, project: &str) -> Result<Vec<BuildInfo>, CiError> {
        self.count("list_builds");
        Ok(self
            .builds
            .lock()
            .unwrap()
            .get(project)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_artifacts(
        &self,
        _project: &str,
        build: &BuildInfo,
    ) -> Result<Vec<Artifact>, CiError> {
        self.count("list_artifacts");
        Ok(self
            .artifacts
            .lock()
            .unwrap()
            .get(&build.number)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_artifact(&self, url: &str) -> Result<String, CiError> {
        self.count("fetch_artifact");
        self.bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(CiError::Rejected { status: 404 })
    }
}

/// Every component wired to the fakes and an in-memory store.
pub struct Harness {
    pub ctx: Context,
    pub scm: Arc<FakeScm>,
    pub ci: Arc<FakeCi>,
    pub intake: Intake,
    pub jobs: JobManager,
    pub reporters: ReporterHub,
    pub notifier: Notifier,
}

impl Harness {
    /// Feed every queued event to the subscribers, including the events
    /// they publish in turn, until the bus is quiet. Returns the kinds seen.
    pub async fn pump(&self, rx: &mut broadcast::Receiver<Event>) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        loop {
            let event = match rx.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return kinds,
                Err(TryRecvError::Lagged(skipped)) => panic!("test bus lagged by {skipped}"),
            };
            kinds.push(event.kind());
            self.jobs.handle(event.clone()).await.unwrap();
            self.reporters.handle(event.clone()).await.unwrap();
            self.notifier.handle(event).await.unwrap();
        }
    }
}

pub fn config() -> Config {
    let mut config = Config {
        github: GitHubConfig {
            owner: "acme".to_string(),
            bot_handle: "buildbot".to_string(),
            repos: vec!["widgets".to_string()],
            retry_whitelist: vec!["carol".to_string()],
            ..GitHubConfig::default()
        },
        ci: CiConfig {
            url: "http://ci".to_string(),
            token: Some("secret".to_string()),
            project: Some("widgets-build".to_string()),
            ..CiConfig::default()
        },
        ..Config::default()
    };
    config.reporters.phpcs.enabled = true;
    config.reporters.phpunit.enabled = true;
    config
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(config: Config) -> Harness {
    let scm = Arc::new(FakeScm::default());
    let ci = Arc::new(FakeCi::default());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ctx = Context::new(config, store, scm.clone(), ci.clone());
    Harness {
        intake: Intake::new(ctx.clone()),
        jobs: JobManager::new(ctx.clone()),
        reporters: ReporterHub::from_config(ctx.clone()),
        notifier: Notifier::new(ctx.clone()),
        ctx,
        scm,
        ci,
    }
}

/// Collect everything currently queued on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn created_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

pub fn updated_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap()
}

/// An open, mergeable pull by alice from `alice:feature`.
pub fn gh_pull(number: u64, sha: &str) -> GhPull {
    GhPull {
        number,
        title: format!("Pull {number}"),
        body: Some("Adds a feature".to_string()),
        user: GhUser {
            login: "alice".to_string(),
        },
        head: GhHead {
            sha: sha.to_string(),
            label: "alice:feature".to_string(),
            repo: Some(GhRepository {
                name: "widgets".to_string(),
                ssh_url: Some("git@github.com:alice/widgets.git".to_string()),
            }),
        },
        mergeable: Some(true),
        state: Some("open".to_string()),
        created_at: created_at(),
        updated_at: updated_at(),
    }
}

pub fn pull_request(repo: &str, number: u64, sha: &str) -> PullRequest {
    gh_pull(number, sha).into_pull_request(repo)
}

pub fn pull_record(repo: &str, number: u64) -> PullRecord {
    PullRecord {
        repo: repo.to_string(),
        number,
        head_sha: None,
        created_at: created_at(),
        updated_at: updated_at(),
        files: Vec::new(),
        jobs: Vec::new(),
    }
}

pub fn changed_file(filename: &str, patch: &str) -> ChangedFile {
    ChangedFile {
        filename: filename.to_string(),
        status: "modified".to_string(),
        patch: Some(patch.to_string()),
        blob_url: None,
    }
}

pub fn file_diff(filename: &str, patch: &str) -> FileDiff {
    FileDiff {
        filename: filename.to_string(),
        sha: "abc".to_string(),
        status: "modified".to_string(),
        ranges: diff::build_ranges(patch).unwrap(),
        reported: Default::default(),
    }
}

pub fn comment(body: &str, author: &str, at: DateTime<Utc>) -> IssueComment {
    IssueComment {
        body: body.to_string(),
        user: GhUser {
            login: author.to_string(),
        },
        created_at: at,
    }
}

/// A build of `widgets-build` carrying `job_id` as its correlation token.
/// `result: None` means still running.
pub fn build_info(job_id: &str, number: u64, result: Option<&str>) -> BuildInfo {
    BuildInfo {
        number,
        url: format!("http://ci/job/widgets-build/{number}/"),
        building: result.is_none(),
        result: result.map(str::to_string),
        parameters: vec![
            ("PULL".to_string(), "1".to_string()),
            (CORRELATION_PARAM.to_string(), job_id.to_string()),
        ],
    }
}
