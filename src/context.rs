use std::sync::Arc;

use crate::ci::CiServer;
use crate::config::Config;
use crate::events::EventBus;
use crate::github::SourceControl;
use crate::store::PullStore;

/// Everything a component needs, built once at startup and cloned into each
/// component's task.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub bus: EventBus,
    pub store: Arc<dyn PullStore>,
    pub scm: Arc<dyn SourceControl>,
    pub ci: Arc<dyn CiServer>,
}

impl Context {
    pub fn new(
        config: Config,
        store: Arc<dyn PullStore>,
        scm: Arc<dyn SourceControl>,
        ci: Arc<dyn CiServer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            bus: EventBus::default(),
            store,
            scm,
            ci,
        }
    }
}
