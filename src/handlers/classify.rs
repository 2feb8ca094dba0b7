/// Zero-shot content classification gate
use crate::{
    error::{PipelineError, PipelineResult},
    event::{Event, Operation},
    handlers::{check_status, http_client},
    pipeline::{Decision, Handler},
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One candidate label and the model's confidence in it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: String,
    pub score: f64,
}

/// Scores text against a set of candidate labels
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str, labels: &[String]) -> PipelineResult<Vec<LabelScore>>;
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    inputs: &'a str,
    parameters: ClassifyParameters<'a>,
}

#[derive(Serialize)]
struct ClassifyParameters<'a> {
    candidate_labels: &'a [String],
}

#[derive(Deserialize)]
struct ClassifyResponse {
    labels: Vec<String>,
    scores: Vec<f64>,
}

/// Zero-shot classification endpoint client
pub struct HttpClassifier {
    http_client: Client,
    endpoint: String,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> PipelineResult<Self> {
        Ok(Self {
            http_client: http_client(timeout)?,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, text: &str, labels: &[String]) -> PipelineResult<Vec<LabelScore>> {
        let request = ClassifyRequest {
            inputs: text,
            parameters: ClassifyParameters {
                candidate_labels: labels,
            },
        };

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::External(format!("Classifier request failed: {}", e)))?;
        let reply: ClassifyResponse = check_status("classifier", response).await?.json().await?;

        if reply.labels.len() != reply.scores.len() {
            return Err(PipelineError::External(format!(
                "classifier returned {} labels but {} scores",
                reply.labels.len(),
                reply.scores.len()
            )));
        }

        Ok(reply
            .labels
            .into_iter()
            .zip(reply.scores)
            .map(|(label, score)| LabelScore { label, score })
            .collect())
    }
}

/// Keeps events that match a candidate label above the threshold
pub struct ClassifyHandler {
    classifier: Arc<dyn Classifier>,
    labels: Vec<String>,
    threshold: f64,
}

impl ClassifyHandler {
    pub fn new(classifier: Arc<dyn Classifier>, labels: Vec<String>, threshold: f64) -> Self {
        Self {
            classifier,
            labels,
            threshold,
        }
    }
}

#[async_trait]
impl Handler for ClassifyHandler {
    fn name(&self) -> &'static str {
        "classify"
    }

    async fn apply(&self, event: &mut Event) -> PipelineResult<Decision> {
        if event.operation == Operation::Delete {
            return Ok(Decision::stop("delete operation"));
        }
        if event.text.trim().is_empty() {
            return Ok(Decision::stop("empty text"));
        }

        let scores = self.classifier.classify(&event.text, &self.labels).await?;
        let best = scores
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score));

        let Some(best) = best else {
            return Ok(Decision::stop("classifier returned no scores"));
        };
        event.similarity_score = Some(best.score);
        debug!(uri = %event.uri, "Best label {} at {:.3}", best.label, best.score);

        if best.score > self.threshold {
            Ok(Decision::ok())
        } else {
            Ok(Decision::stop(format!(
                "best label {} scored {:.3}, needs > {:.2}",
                best.label, best.score, self.threshold
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::POST_COLLECTION;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        score: f64,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(score: f64) -> Arc<Self> {
            Arc::new(Self {
                score,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Classifier for Fixed {
        async fn classify(&self, _text: &str, labels: &[String]) -> PipelineResult<Vec<LabelScore>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(labels
                .iter()
                .enumerate()
                .map(|(i, label)| LabelScore {
                    label: label.clone(),
                    score: self.score / (i + 1) as f64,
                })
                .collect())
        }
    }

    fn handler(classifier: Arc<Fixed>) -> ClassifyHandler {
        ClassifyHandler::new(classifier, vec!["news".to_string(), "sports".to_string()], 0.90)
    }

    fn post(text: &str, operation: Operation) -> Event {
        Event::new("did:plc:c", POST_COLLECTION, "1", operation, text, "1")
    }

    #[tokio::test]
    async fn test_high_score_passes_and_records_score() {
        let classifier = Fixed::new(0.95);
        let mut event = post("Election results are in", Operation::Create);
        let decision = handler(classifier.clone()).apply(&mut event).await.unwrap();

        assert!(decision.proceed);
        assert_eq!(event.similarity_score, Some(0.95));
    }

    #[tokio::test]
    async fn test_score_at_threshold_is_not_enough() {
        let mut event = post("meh", Operation::Create);
        let decision = handler(Fixed::new(0.90)).apply(&mut event).await.unwrap();
        assert!(!decision.proceed);
        assert_eq!(event.similarity_score, Some(0.90));
    }

    #[tokio::test]
    async fn test_empty_and_delete_skip_the_model() {
        let classifier = Fixed::new(0.99);
        let handler = handler(classifier.clone());

        let decision = handler.apply(&mut post("   ", Operation::Create)).await.unwrap();
        assert_eq!(decision, Decision::stop("empty text"));

        let decision = handler.apply(&mut post("gone", Operation::Delete)).await.unwrap();
        assert_eq!(decision, Decision::stop("delete operation"));

        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_request_body_shape() {
        let labels = vec!["news".to_string()];
        let body = serde_json::to_value(ClassifyRequest {
            inputs: "hello",
            parameters: ClassifyParameters {
                candidate_labels: &labels,
            },
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"inputs": "hello", "parameters": {"candidate_labels": ["news"]}})
        );
    }
}
