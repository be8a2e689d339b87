use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::intake::{Intake, IntakeError, RawEvent};
use crate::jobs::JobManager;
use crate::store::StoreError;

/// Run `tick` every `period` on its own task. A tick that finds the
/// previous pass still running is skipped. Returns the first store failure.
async fn every<F, Fut>(name: &'static str, period: Duration, tick: F) -> Result<(), StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), StoreError>> + Send + 'static,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let busy = Arc::new(Mutex::new(()));
    let (fatal_tx, mut fatal_rx) = mpsc::channel(1);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Ok(guard) = busy.clone().try_lock_owned() else {
                    debug!(poller = name, "previous pass still running; skipping tick");
                    continue;
                };
                let fatal = fatal_tx.clone();
                let pass = tick();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(err) = pass.await {
                        let _ = fatal.send(err).await;
                    }
                });
            }
            Some(err) = fatal_rx.recv() => {
                error!(poller = name, error = %err, "store failure");
                return Err(err);
            }
        }
    }
}

/// Feed every open pull of every watched repository to intake.
pub async fn poll_repos(ctx: &Context, intake: &Intake) -> Result<(), StoreError> {
    for repo in &ctx.config.github.repos {
        let pulls = match ctx.scm.list_open_pulls(repo).await {
            Ok(pulls) => pulls,
            Err(err) => {
                warn!(repo = %repo, error = %err, "failed to list open pulls");
                continue;
            }
        };
        debug!(repo = %repo, count = pulls.len(), "polled open pulls");

        for pull in pulls {
            let number = pull.number;
            let event = RawEvent::Polled {
                repo: repo.clone(),
                pull,
            };
            match intake.handle(event).await {
                Ok(_) => {}
                Err(IntakeError::Store(err)) => return Err(err),
                Err(err) => warn!(repo = %repo, pull = number, error = %err, "polled pull not processed"),
            }
        }
    }
    Ok(())
}

/// Poll GitHub for open pulls; the intake used instead of webhooks.
pub async fn run_github(ctx: Context) -> Result<(), StoreError> {
    let period = Duration::from_millis(ctx.config.github.frequency_ms);
    info!(repos = ctx.config.github.repos.len(), ?period, "polling GitHub");
    let intake = Intake::new(ctx.clone());
    every("github", period, move || {
        let ctx = ctx.clone();
        let intake = intake.clone();
        async move { poll_repos(&ctx, &intake).await }
    })
    .await
}

/// Reconcile outstanding jobs against the CI server.
pub async fn run_ci(jobs: JobManager, period: Duration) -> Result<(), StoreError> {
    info!(?period, "polling CI server");
    every("ci", period, move || {
        let jobs = jobs.clone();
        async move { jobs.poll().await }
    })
    .await
}
