use crate::{
    error::PipelineResult,
    event::Event,
    pipeline::{Decision, Handler},
    store::IndexStore,
};
use async_trait::async_trait;
use std::sync::Arc;

pub const TOPICS_FIELD: &str = "topics";

/// Hash key a persisted event is stored under
pub fn record_key(prefix: &str, uri: &str) -> String {
    format!("{}{}", prefix, uri)
}

/// Upserts the event, keyed by uri, so replays overwrite rather than duplicate
pub struct PersistHandler {
    index: Arc<dyn IndexStore>,
    prefix: String,
}

impl PersistHandler {
    pub fn new(index: Arc<dyn IndexStore>, prefix: impl Into<String>) -> Self {
        Self {
            index,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl Handler for PersistHandler {
    fn name(&self) -> &'static str {
        "persist"
    }

    async fn apply(&self, event: &mut Event) -> PipelineResult<Decision> {
        let mut fields = event.to_fields();
        fields.push((TOPICS_FIELD, event.topics.join(",")));
        self.index
            .upsert(&record_key(&self.prefix, &event.uri), &fields)
            .await?;
        Ok(Decision::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{fields, Operation, POST_COLLECTION};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let handler = PersistHandler::new(store.clone(), "post:");

        let mut event = Event::new("did:plc:p", POST_COLLECTION, "7", Operation::Create, "hi", "1");
        event.topics = vec!["a".to_string(), "b".to_string()];
        handler.apply(&mut event).await.unwrap();
        handler.apply(&mut event).await.unwrap();

        let key = record_key("post:", &event.uri);
        let stored = store.fetch(&key).await.unwrap().unwrap();
        assert_eq!(stored.get(TOPICS_FIELD).map(String::as_str), Some("a,b"));
        assert_eq!(stored.get(fields::TEXT).map(String::as_str), Some("hi"));
        assert_eq!(store.upsert_count(), 2);
        assert_eq!(Event::from_fields(&stored).unwrap().uri, event.uri);
    }
}
