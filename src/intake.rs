use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::context::Context;
use crate::events::Event;
use crate::github::{
    ChangedFile, GhPull, IssueComment, IssueCommentEvent, PullRequestEvent, ScmError,
};
use crate::pr::{diff, parse_blob_sha, FileDiff, PullRequest};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error(transparent)]
    Scm(#[from] ScmError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A pull request or comment event as delivered by a webhook or a poll.
#[derive(Debug, Clone)]
pub enum RawEvent {
    PullRequest(PullRequestEvent),
    IssueComment(IssueCommentEvent),
    /// An open pull seen by the polling loop; carries no action
    Polled { repo: String, pull: GhPull },
}

/// Filters and normalizes raw events, then emits `pull.found`.
#[derive(Clone)]
pub struct Intake {
    ctx: Context,
}

impl Intake {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Handle one raw event. Returns the pull emitted as `pull.found`, if any.
    pub async fn handle(&self, event: RawEvent) -> Result<Option<PullRequest>, IntakeError> {
        match event {
            RawEvent::PullRequest(event) => {
                let pull = event.pull_request.into_pull_request(&event.repository.name);
                self.handle_pull(event.action.as_deref(), pull).await
            }
            RawEvent::IssueComment(event) => self.handle_comment(event).await,
            RawEvent::Polled { repo, pull } => {
                self.handle_pull(None, pull.into_pull_request(&repo)).await
            }
        }
    }

    #[instrument(skip(self, pull), fields(pull = %pull.key(), action = ?action))]
    async fn handle_pull(
        &self,
        action: Option<&str>,
        mut pull: PullRequest,
    ) -> Result<Option<PullRequest>, IntakeError> {
        let github = &self.ctx.config.github;

        if let Some(action) = action {
            if action != "opened" && action != "synchronize" {
                debug!("ignoring pull request action");
                return Ok(None);
            }
        }

        if has_ignore_directive(&pull.body, &github.bot_handle) {
            debug!("pull body asks to be ignored");
            return Ok(None);
        }

        if pull.mergeable == Some(false) {
            debug!("pull is not mergeable");
            return Ok(None);
        }

        if !github.skip_file_listing {
            let files = self.ctx.scm.get_files(&pull.repo, pull.number).await?;
            pull.files = build_file_diffs(files, &pull.head_sha);
            if pull.files.is_empty() {
                debug!("no changed files listed");
                return Ok(None);
            }
        }

        info!(title = %pull.title, files = pull.files.len(), head = %pull.head_sha, "pull found");
        self.ctx.bus.publish(Event::PullFound(pull.clone()));
        Ok(Some(pull))
    }

    #[instrument(skip(self, event), fields(repo = %event.repository.name, issue = event.issue.number))]
    async fn handle_comment(
        &self,
        event: IssueCommentEvent,
    ) -> Result<Option<PullRequest>, IntakeError> {
        let github = &self.ctx.config.github;

        if event.issue.pull_request.is_none() {
            debug!("comment is on a plain issue");
            return Ok(None);
        }
        if event.action.as_deref().is_some_and(|action| action != "created") {
            return Ok(None);
        }
        if !mentions_retest(&event.comment.body, &github.bot_handle) {
            return Ok(None);
        }

        let repo = event.repository.name;
        let gh = self.ctx.scm.get_pull(&repo, event.issue.number).await?;
        let mut pull = gh.into_pull_request(&repo);
        let watermark = self
            .ctx
            .store
            .find_pull(&pull.key())?
            .map(|record| record.updated_at);

        if !qualifies_as_retest(
            &event.comment,
            &github.bot_handle,
            &github.retry_whitelist,
            &pull.author,
            watermark,
        ) {
            debug!(author = %event.comment.user.login, "retest comment does not qualify");
            return Ok(None);
        }

        info!(author = %event.comment.user.login, "retest requested");
        pull.skip_comments = Some(event.comment.created_at);
        self.handle_pull(None, pull).await
    }
}

fn has_ignore_directive(body: &str, bot: &str) -> bool {
    body.contains(&format!("@{bot} ignore"))
}

fn mentions_retest(body: &str, bot: &str) -> bool {
    body.contains(&format!("@{bot} retest"))
}

/// A retest request counts when it addresses the bot, comes from a
/// whitelisted user or the pull's author (anyone when no whitelist is set),
/// and is newer than the stored watermark.
pub fn qualifies_as_retest(
    comment: &IssueComment,
    bot: &str,
    whitelist: &[String],
    pull_author: &str,
    watermark: Option<DateTime<Utc>>,
) -> bool {
    let author = comment.user.login.as_str();
    let allowed =
        whitelist.is_empty() || author == pull_author || whitelist.iter().any(|u| u == author);
    mentions_retest(&comment.body, bot)
        && allowed
        && watermark.map_or(true, |since| comment.created_at > since)
}

/// Build one `FileDiff` per listed file. Files whose patch cannot be parsed
/// keep their entry but expose no addressable ranges.
pub fn build_file_diffs(files: Vec<ChangedFile>, head_sha: &str) -> Vec<FileDiff> {
    files
        .into_iter()
        .filter(|file| !file.filename.is_empty())
        .map(|file| {
            let ranges = match file.patch.as_deref().map(diff::build_ranges) {
                Some(Ok(ranges)) => ranges,
                Some(Err(err)) => {
                    warn!(file = %file.filename, error = %err, "skipping unparseable patch");
                    Vec::new()
                }
                None => Vec::new(),
            };
            let sha = file
                .blob_url
                .as_deref()
                .and_then(|url| parse_blob_sha(url).ok())
                .unwrap_or_else(|| head_sha.to_string());
            FileDiff {
                filename: file.filename,
                sha,
                status: file.status,
                ranges,
                reported: Default::default(),
            }
        })
        .collect()
}
