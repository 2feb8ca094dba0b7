use crate::{
    error::PipelineResult,
    event::Event,
    pipeline::{Decision, Handler},
    store::StreamStore,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Appends surviving events to a downstream stream, trimmed to `max_len`
pub struct RepublishHandler {
    log: Arc<dyn StreamStore>,
    stream: String,
    max_len: usize,
}

impl RepublishHandler {
    pub fn new(log: Arc<dyn StreamStore>, stream: impl Into<String>, max_len: usize) -> Self {
        Self {
            log,
            stream: stream.into(),
            max_len,
        }
    }
}

#[async_trait]
impl Handler for RepublishHandler {
    fn name(&self) -> &'static str {
        "republish"
    }

    async fn apply(&self, event: &mut Event) -> PipelineResult<Decision> {
        let id = self
            .log
            .append(&self.stream, &event.to_fields(), Some(self.max_len))
            .await?;
        debug!(uri = %event.uri, "Republished to {} as {}", self.stream, id);
        Ok(Decision::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Operation, POST_COLLECTION};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_republish_caps_downstream() {
        let store = Arc::new(MemoryStore::new());
        let handler = RepublishHandler::new(store.clone(), "filtered", 3);

        for i in 0..5 {
            let mut event = Event::new("did:plc:r", POST_COLLECTION, i.to_string(), Operation::Create, "t", "1")
                .with_langs(["en"]);
            event.similarity_score = Some(0.97);
            assert!(handler.apply(&mut event).await.unwrap().proceed);
        }

        assert_eq!(store.stream_len("filtered").await.unwrap(), 3);
    }
}
