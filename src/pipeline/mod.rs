/// Consumer-group pipeline: handler chain, runner loop and runner pool
///
/// Each entry read from a consumer group is decoded into an `Event` and run
/// through an ordered list of handlers. The first handler that declines stops
/// the chain; either way the entry is acknowledged and its uri marked seen in
/// a single atomic step.

pub mod chain;
pub mod pool;
pub mod runner;

pub use chain::{AckTarget, HandlerChain, Outcome};
pub use pool::RunnerPool;
pub use runner::{ConsumerRunner, RunnerOptions, RunnerState, RunnerStats, StopReason};

use crate::{error::PipelineResult, event::Event};
use async_trait::async_trait;

/// A handler's verdict on one event
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub proceed: bool,
    pub message: String,
}

impl Decision {
    /// Keep going to the next handler
    pub fn ok() -> Self {
        Self {
            proceed: true,
            message: "OK".to_string(),
        }
    }

    /// Stop the chain for this event
    pub fn stop(message: impl Into<String>) -> Self {
        Self {
            proceed: false,
            message: message.into(),
        }
    }
}

/// One stage of a pipeline
///
/// Returning `Err` means the attempt failed: the entry is left pending and
/// will be redelivered, so any side effect a handler has must be safe to
/// repeat.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, event: &mut Event) -> PipelineResult<Decision>;
}
