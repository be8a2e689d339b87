pub mod bus;
pub mod types;

pub use bus::EventBus;
pub use types::{
    ArtifactFound, BuildUpdate, Event, InlineComment, ProcessedPull, PullComment, TriggerReason,
};
