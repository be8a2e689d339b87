use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, instrument, warn};

use crate::context::Context;
use crate::events::{BuildUpdate, Event};
use crate::github::{CommitState, ScmError};

/// Mirrors build progress and reporter output back to GitHub: commit
/// statuses for build events, comments for `pull.inline_status` and
/// `pull.status`.
#[derive(Clone)]
pub struct Notifier {
    ctx: Context,
}

impl Notifier {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Failures to reach GitHub are logged and dropped; the build outcome is
    /// already recorded.
    pub async fn run(self, mut events: broadcast::Receiver<Event>) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notifier fell behind the event bus");
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            let kind = event.kind();
            if let Err(err) = self.handle(event).await {
                warn!(error = %err, event = kind, "failed to notify GitHub");
            }
        }
    }

    pub async fn handle(&self, event: Event) -> Result<(), ScmError> {
        match event {
            Event::BuildStarted(update) => {
                self.status(&update, CommitState::Pending, "Testing Pull Request").await
            }
            Event::BuildSucceeded(update) => {
                self.status(&update, CommitState::Success, "Build succeeded").await
            }
            Event::BuildFailed(update) => {
                self.status(&update, CommitState::Failure, "Build failed").await
            }
            Event::BuildAborted(update) => {
                self.status(&update, CommitState::Error, "Build aborted").await
            }
            Event::InlineStatus(comment) => {
                debug!(pull = %comment.pull, file = %comment.file, position = comment.position, "posting inline comment");
                self.ctx
                    .scm
                    .create_inline_comment(
                        &comment.pull.repo,
                        comment.pull.number,
                        &comment.sha,
                        &comment.file,
                        comment.position,
                        &comment.body,
                    )
                    .await
            }
            Event::PullStatus(comment) => {
                debug!(pull = %comment.pull, "posting pull comment");
                self.ctx
                    .scm
                    .create_comment(&comment.pull.repo, comment.pull.number, &comment.body)
                    .await
            }
            _ => Ok(()),
        }
    }

    #[instrument(skip(self, update), fields(pull = %update.pull, job = %update.job.id))]
    async fn status(
        &self,
        update: &BuildUpdate,
        state: CommitState,
        description: &str,
    ) -> Result<(), ScmError> {
        debug!(state = state.as_str(), "setting commit status");
        self.ctx
            .scm
            .set_commit_status(
                &update.pull.repo,
                &update.job.head_sha,
                state,
                &update.url,
                description,
            )
            .await
    }
}
