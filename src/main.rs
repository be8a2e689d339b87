mod ci;
mod config;
mod context;
mod events;
mod github;
mod intake;
mod jobs;
mod notify;
mod poller;
mod pr;
mod reporters;
mod rules;
mod server;
mod store;
#[cfg(test)]
mod testing;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::ci::JenkinsClient;
use crate::config::{Config, IntakeMethod};
use crate::context::Context;
use crate::github::GitHubClient;
use crate::intake::Intake;
use crate::jobs::JobManager;
use crate::notify::Notifier;
use crate::reporters::ReporterHub;
use crate::server::WebhookState;
use crate::store::SqliteStore;

/// PR Buildbot: watches GitHub pull requests, triggers a Jenkins build per
/// code change or retest request, and reports results back on the pull.
#[derive(Parser, Debug)]
#[command(name = "pr-buildbot", version, about)]
struct Cli {
    /// Path to the config file (defaults to ./.pr-buildbot.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override how pull request events are received
    #[arg(long, value_enum)]
    mode: Option<IntakeMethod>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    info!("loading configuration");
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(mode) = cli.mode {
        config.github.method = mode;
    }

    let store = Arc::new(SqliteStore::open(&config.store.path)?);
    info!(path = %config.store.path, "store opened");
    let scm = Arc::new(GitHubClient::new(&config.github, config.http_timeout())?);
    let ci = Arc::new(JenkinsClient::new(&config.ci, config.http_timeout())?);
    let ctx = Context::new(config, store, scm, ci);

    let jobs = JobManager::new(ctx.clone());
    let reporters = ReporterHub::from_config(ctx.clone());
    let notifier = Notifier::new(ctx.clone());
    let ci_period = Duration::from_millis(ctx.config.ci.frequency_ms);
    let (fatal_tx, mut fatal_rx) = mpsc::channel(1);

    // Subscribe every consumer before any producer can publish.
    let jobs_events = ctx.bus.subscribe();
    let reporter_events = ctx.bus.subscribe();
    let notifier_events = ctx.bus.subscribe();

    let intake_task = {
        let ctx = ctx.clone();
        async move {
            match ctx.config.github.method {
                IntakeMethod::Hooks => {
                    let state = WebhookState::new(
                        Intake::new(ctx.clone()),
                        ctx.config.github.allowed_ips.clone(),
                        fatal_tx,
                    );
                    server::serve(state, ctx.config.github.port)
                        .await
                        .map_err(Box::<dyn std::error::Error>::from)
                }
                IntakeMethod::Polling => poller::run_github(ctx)
                    .await
                    .map_err(Box::<dyn std::error::Error>::from),
            }
        }
    };

    info!(method = ?ctx.config.github.method, "buildbot running");
    tokio::select! {
        result = jobs.clone().run(jobs_events) => result?,
        result = reporters.run(reporter_events) => result?,
        () = notifier.run(notifier_events) => {}
        result = poller::run_ci(jobs, ci_period) => result?,
        result = intake_task => result?,
        Some(err) = fatal_rx.recv() => return Err(err.into()),
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    Ok(())
}
