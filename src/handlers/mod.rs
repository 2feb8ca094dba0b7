/// Pipeline stages
///
/// Each handler holds the collaborators it needs as explicit `Arc` handles.
/// Model-backed stages talk to their model through a trait so tests can
/// swap in a canned implementation.

pub mod classify;
pub mod dedup;
pub mod language;
pub mod persist;
pub mod republish;
pub mod topics;

pub use classify::{Classifier, ClassifyHandler, HttpClassifier, LabelScore};
pub use dedup::DedupHandler;
pub use language::LanguageHandler;
pub use persist::PersistHandler;
pub use republish::RepublishHandler;
pub use topics::{parse_topics, ExtractTopicsHandler, HttpTopicExtractor, TopicExtractor};

use crate::error::{PipelineError, PipelineResult};
use std::time::Duration;

/// Shared HTTP client for model endpoints
pub(crate) fn http_client(timeout: Duration) -> PipelineResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PipelineError::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Turn a non-2xx model reply into an `External` error
pub(crate) async fn check_status(
    service: &str,
    response: reqwest::Response,
) -> PipelineResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PipelineError::External(format!(
        "{} returned {}: {}",
        service, status, body
    )))
}
