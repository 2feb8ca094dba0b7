/// skystream - Bluesky firehose pipeline
///
/// Jetstream commits land in a raw Redis stream. Two consumer-group
/// pipelines then deduplicate, filter, classify and enrich them. Every
/// handled entry is acknowledged and marked seen in one atomic step.

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod firehose;
pub mod handlers;
pub mod metrics;
pub mod pipeline;
pub mod routing;
pub mod server;
pub mod store;
pub mod topics;

pub use config::PipelineConfig;
pub use context::AppContext;
pub use error::{PipelineError, PipelineResult};
