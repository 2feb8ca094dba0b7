/// Handler chain executor
use crate::{
    error::{PipelineError, PipelineResult},
    event::{Event, StreamEntry},
    metrics,
    pipeline::Handler,
    store::{AckAndMark, StreamStore},
};
use std::sync::Arc;
use tracing::{info, warn};

/// Where a handled entry is acknowledged and marked seen
#[derive(Debug, Clone)]
pub struct AckTarget {
    pub stream: String,
    pub group: String,
    pub filter: String,
}

/// Result of running the chain over one entry
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Every handler continued
    Kept,
    /// A handler (or decoding) stopped the chain
    Rejected {
        handler: &'static str,
        reason: String,
    },
}

/// Ordered handlers plus the atomic ack + mark-seen step
pub struct HandlerChain {
    pipeline: String,
    handlers: Vec<Arc<dyn Handler>>,
    log: Arc<dyn StreamStore>,
    target: AckTarget,
}

impl HandlerChain {
    pub fn new(
        pipeline: impl Into<String>,
        handlers: Vec<Arc<dyn Handler>>,
        log: Arc<dyn StreamStore>,
        target: AckTarget,
    ) -> PipelineResult<Self> {
        let pipeline = pipeline.into();
        if handlers.is_empty() {
            return Err(PipelineError::Config(format!(
                "pipeline {} has no handlers",
                pipeline
            )));
        }
        Ok(Self {
            pipeline,
            handlers,
            log,
            target,
        })
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn target(&self) -> &AckTarget {
        &self.target
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Run every handler over the entry, then ack + mark exactly once
    ///
    /// A handler error returns early without acknowledging, leaving the entry
    /// pending for redelivery.
    pub async fn process(&self, entry: &StreamEntry) -> PipelineResult<Outcome> {
        let mut event = match Event::from_fields(&entry.fields) {
            Ok(event) => event,
            Err(e) => return self.drop_undecodable(entry, e).await,
        };

        let mut outcome = Outcome::Kept;
        for handler in &self.handlers {
            let timer = metrics::HANDLER_DURATION_SECONDS
                .with_label_values(&[handler.name()])
                .start_timer();
            let result = handler.apply(&mut event).await;
            timer.observe_duration();

            let decision = result.map_err(|e| {
                metrics::EVENTS_TOTAL
                    .with_label_values(&[&self.pipeline, "failed"])
                    .inc();
                warn!(
                    pipeline = %self.pipeline,
                    uri = %event.uri,
                    entry_id = %entry.id,
                    handler = handler.name(),
                    "Handler failed, entry left pending: {}",
                    e
                );
                e
            })?;

            if !decision.proceed {
                info!(
                    pipeline = %self.pipeline,
                    uri = %event.uri,
                    entry_id = %entry.id,
                    handler = handler.name(),
                    "Rejected: {}",
                    decision.message
                );
                outcome = Outcome::Rejected {
                    handler: handler.name(),
                    reason: decision.message,
                };
                break;
            }
        }

        self.acknowledge(entry, &event).await?;

        let label = match outcome {
            Outcome::Kept => {
                info!(
                    pipeline = %self.pipeline,
                    uri = %event.uri,
                    entry_id = %entry.id,
                    topics = %event.topics.join(","),
                    "Kept"
                );
                "kept"
            }
            Outcome::Rejected { .. } => "rejected",
        };
        metrics::EVENTS_TOTAL
            .with_label_values(&[&self.pipeline, label])
            .inc();

        Ok(outcome)
    }

    async fn acknowledge(&self, entry: &StreamEntry, event: &Event) -> PipelineResult<()> {
        let target = AckAndMark {
            stream: &self.target.stream,
            group: &self.target.group,
            entry_id: &entry.id,
            filter: &self.target.filter,
            key: &event.uri,
        };
        self.log.ack_and_mark(&target).await.map_err(|e| {
            metrics::ACK_FAILURES_TOTAL
                .with_label_values(&[&self.pipeline])
                .inc();
            metrics::EVENTS_TOTAL
                .with_label_values(&[&self.pipeline, "failed"])
                .inc();
            e
        })
    }

    /// Poison entries have no uri to mark, so they are only acknowledged
    async fn drop_undecodable(&self, entry: &StreamEntry, error: PipelineError) -> PipelineResult<Outcome> {
        warn!(
            pipeline = %self.pipeline,
            entry_id = %entry.id,
            "Dropping undecodable entry: {}",
            error
        );
        self.log
            .ack(&self.target.stream, &self.target.group, &entry.id)
            .await?;
        metrics::EVENTS_TOTAL
            .with_label_values(&[&self.pipeline, "rejected"])
            .inc();
        Ok(Outcome::Rejected {
            handler: "decode",
            reason: error.to_string(),
        })
    }
}
