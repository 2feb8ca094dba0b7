/// Topic extraction through a generative language model
use crate::{
    error::{PipelineError, PipelineResult},
    event::Event,
    handlers::{check_status, http_client},
    pipeline::{Decision, Handler},
    topics::{TimeBucket, TopicTracker},
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Produces a comma separated topic list for a piece of text
#[async_trait]
pub trait TopicExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> PipelineResult<String>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

fn prompt_for(text: &str, max_topics: usize) -> String {
    format!(
        "List at most {} short topics for the following social media post. \
         Reply with the topics only, separated by commas.\n\nPost: {}",
        max_topics, text
    )
}

/// Ollama `/api/generate` client
pub struct HttpTopicExtractor {
    http_client: Client,
    endpoint: String,
    model: String,
    max_topics: usize,
}

impl HttpTopicExtractor {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        max_topics: usize,
        timeout: Duration,
    ) -> PipelineResult<Self> {
        Ok(Self {
            http_client: http_client(timeout)?,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            max_topics,
        })
    }
}

#[async_trait]
impl TopicExtractor for HttpTopicExtractor {
    async fn extract(&self, text: &str) -> PipelineResult<String> {
        let url = format!("{}/api/generate", self.endpoint);
        let request = GenerateRequest {
            model: &self.model,
            prompt: prompt_for(text, self.max_topics),
            stream: false,
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::External(format!("Topic model request failed: {}", e)))?;
        let reply: GenerateResponse = check_status("topic model", response).await?.json().await?;
        Ok(reply.response)
    }
}

/// Drop a leading bullet (`-`, `*`, `•`) or list number (`1.`, `2)`)
fn strip_list_marker(item: &str) -> &str {
    let item = item.trim_start();
    if let Some(rest) = item.strip_prefix(['-', '*', '•']) {
        return rest;
    }
    let digits = item.len() - item.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits > 0 {
        if let Some(rest) = item[digits..].strip_prefix(['.', ')']) {
            return rest;
        }
    }
    item
}

/// Normalize a model reply into at most `max` distinct topics
///
/// Accepts comma separated replies as well as one topic per line.
pub fn parse_topics(reply: &str, max: usize) -> Vec<String> {
    let mut topics: Vec<String> = Vec::new();
    for raw in reply.split([',', '\n']) {
        let topic = strip_list_marker(raw)
            .trim_matches(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '.' | '#'))
            .to_lowercase();
        if topic.is_empty() || topics.contains(&topic) {
            continue;
        }
        topics.push(topic);
        if topics.len() == max {
            break;
        }
    }
    topics
}

/// Tags events with topics and counts them in the hourly tracker
pub struct ExtractTopicsHandler {
    extractor: Arc<dyn TopicExtractor>,
    tracker: TopicTracker,
    max_topics: usize,
}

impl ExtractTopicsHandler {
    pub fn new(extractor: Arc<dyn TopicExtractor>, tracker: TopicTracker, max_topics: usize) -> Self {
        Self {
            extractor,
            tracker,
            max_topics,
        }
    }
}

#[async_trait]
impl Handler for ExtractTopicsHandler {
    fn name(&self) -> &'static str {
        "extract-topics"
    }

    async fn apply(&self, event: &mut Event) -> PipelineResult<Decision> {
        if event.text.trim().is_empty() {
            return Ok(Decision::stop("no topics extracted"));
        }

        let reply = self.extractor.extract(&event.text).await?;
        let topics = parse_topics(&reply, self.max_topics);
        if topics.is_empty() {
            return Ok(Decision::stop("no topics extracted"));
        }

        let bucket = event
            .time_micros()
            .and_then(TimeBucket::from_micros)
            .unwrap_or_else(TimeBucket::current);
        self.tracker.record(&topics, bucket).await?;

        event.topics = topics;
        Ok(Decision::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Operation, POST_COLLECTION};
    use crate::store::MemoryStore;
    use crate::topics::TrackerConfig;

    struct Canned(&'static str);

    #[async_trait]
    impl TopicExtractor for Canned {
        async fn extract(&self, _text: &str) -> PipelineResult<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn test_parse_topics_normalizes() {
        assert_eq!(
            parse_topics(" #Rust, \"Async\", rust., , Tokio ", 5),
            vec!["rust", "async", "tokio"]
        );
        assert_eq!(parse_topics("a, b, c, d, e, f, g", 5).len(), 5);
        assert!(parse_topics(" , . ,", 5).is_empty());
    }

    #[test]
    fn test_parse_topics_accepts_lists() {
        assert_eq!(
            parse_topics("1. Rust\n2) Tokio\n- WebAssembly\n* rust", 5),
            vec!["rust", "tokio", "webassembly"]
        );
        assert_eq!(parse_topics("2024 election\n", 5), vec!["2024 election"]);
    }

    #[tokio::test]
    async fn test_topics_are_stored_and_counted() {
        let tracker = TopicTracker::new(Arc::new(MemoryStore::new()), TrackerConfig::default());
        let handler = ExtractTopicsHandler::new(Arc::new(Canned("Rust, Tokio")), tracker.clone(), 5);

        // 2024-09-09T19:46:02Z
        let mut event = Event::new(
            "did:plc:t",
            POST_COLLECTION,
            "1",
            Operation::Create,
            "async runtimes",
            "1725911162329308",
        );
        assert!(handler.apply(&mut event).await.unwrap().proceed);
        assert_eq!(event.topics, vec!["rust", "tokio"]);

        let bucket = TimeBucket::parse("2024-09-09T19").unwrap();
        let mut top = tracker.top_k_for_bucket(bucket, 5).await.unwrap();
        top.sort();
        assert_eq!(top, vec!["rust", "tokio"]);
    }

    #[tokio::test]
    async fn test_empty_reply_stops() {
        let tracker = TopicTracker::new(Arc::new(MemoryStore::new()), TrackerConfig::default());
        let handler = ExtractTopicsHandler::new(Arc::new(Canned("  ")), tracker, 5);
        let mut event = Event::new("did:plc:t", POST_COLLECTION, "1", Operation::Create, "hm", "x");
        assert_eq!(
            handler.apply(&mut event).await.unwrap(),
            Decision::stop("no topics extracted")
        );
    }
}
