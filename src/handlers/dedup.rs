use crate::{
    error::PipelineResult,
    event::Event,
    pipeline::{Decision, Handler},
    store::FilterStore,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Stops events whose uri is already in the pipeline's filter
///
/// Only reads the filter; marking happens in the chain's ack step.
pub struct DedupHandler {
    filters: Arc<dyn FilterStore>,
    filter: String,
}

impl DedupHandler {
    pub fn new(filters: Arc<dyn FilterStore>, filter: impl Into<String>) -> Self {
        Self {
            filters,
            filter: filter.into(),
        }
    }
}

#[async_trait]
impl Handler for DedupHandler {
    fn name(&self) -> &'static str {
        "dedup"
    }

    async fn apply(&self, event: &mut Event) -> PipelineResult<Decision> {
        if self.filters.exists(&self.filter, &event.uri).await? {
            return Ok(Decision::stop(format!("{} already processed", event.uri)));
        }
        Ok(Decision::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{fields, Operation};
    use crate::pipeline::{AckTarget, HandlerChain, Outcome};
    use crate::store::{MemoryStore, ReadCursor, ReadRequest, StreamStore};
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_seen_passes_and_duplicate_stops() {
        let store = Arc::new(MemoryStore::new());
        let handler = DedupHandler::new(store.clone(), "bf:test");

        let mut event = Event {
            uri: "at://x/1".to_string(),
            ..Event::new("", "", "", Operation::Create, "hello", "")
        };
        assert_eq!(handler.apply(&mut event).await.unwrap(), Decision::ok());
        assert_eq!(handler.apply(&mut event).await.unwrap().message, "OK");

        store.add("bf:test", "at://x/1").await.unwrap();
        let decision = handler.apply(&mut event).await.unwrap();
        assert!(!decision.proceed);
        assert_eq!(decision.message, "at://x/1 already processed");
    }

    #[tokio::test]
    async fn test_duplicate_entry_through_chain() {
        let store = Arc::new(MemoryStore::new());
        store.create_group("raw", "g", "0").await.unwrap();
        for _ in 0..2 {
            store
                .append(
                    "raw",
                    &[
                        (fields::URI, "at://x/1".to_string()),
                        (fields::TEXT, "hello".to_string()),
                        (fields::OPERATION, "create".to_string()),
                    ],
                    None,
                )
                .await
                .unwrap();
        }

        let target = AckTarget {
            stream: "raw".to_string(),
            group: "g".to_string(),
            filter: "bf:dedup".to_string(),
        };
        let handlers: Vec<Arc<dyn Handler>> =
            vec![Arc::new(DedupHandler::new(store.clone(), "bf:dedup"))];
        let chain = HandlerChain::new("dedup", handlers, store.clone(), target).unwrap();

        let request = ReadRequest {
            stream: "raw",
            group: "g",
            consumer: "c1",
            count: 2,
            block: Duration::ZERO,
            cursor: ReadCursor::New,
        };
        let entries = store.read_group(&request).await.unwrap();
        assert_eq!(entries.len(), 2);

        assert_eq!(chain.process(&entries[0]).await.unwrap(), Outcome::Kept);
        assert_eq!(
            chain.process(&entries[1]).await.unwrap(),
            Outcome::Rejected {
                handler: "dedup",
                reason: "at://x/1 already processed".to_string()
            }
        );
        assert_eq!(store.pending_count("raw", "g").await.unwrap(), 0);
    }
}
