/// Topic frequency tracking over hourly count-min sketches
use crate::{
    error::{PipelineError, PipelineResult},
    store::{tolerate_exists, SketchStore},
};
use chrono::{DateTime, DurationRound, NaiveDateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const BUCKET_FORMAT: &str = "%Y-%m-%dT%H";

/// Coarse UTC hour a topic mention is counted in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBucket(DateTime<Utc>);

impl TimeBucket {
    pub fn containing(at: DateTime<Utc>) -> Self {
        // truncating to a whole hour cannot overflow for valid timestamps
        Self(at.duration_trunc(TimeDelta::hours(1)).unwrap_or(at))
    }

    pub fn current() -> Self {
        Self::containing(Utc::now())
    }

    /// Bucket for a microsecond timestamp; None when out of range
    pub fn from_micros(micros: i64) -> Option<Self> {
        DateTime::from_timestamp_micros(micros).map(Self::containing)
    }

    /// Parse the `YYYY-MM-DDTHH` label used in sketch keys and the API
    pub fn parse(label: &str) -> PipelineResult<Self> {
        let naive = NaiveDateTime::parse_from_str(&format!("{}:00:00", label), "%Y-%m-%dT%H:%M:%S")
            .map_err(|_| PipelineError::Decode(format!("invalid bucket '{}'", label)))?;
        Ok(Self(naive.and_utc()))
    }

    pub fn label(&self) -> String {
        self.0.format(BUCKET_FORMAT).to_string()
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Sketch dimensions and key layout
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub width: u32,
    pub depth: u32,
    pub sketch_prefix: String,
    pub names_key: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            width: 2000,
            depth: 5,
            sketch_prefix: "topics:cms:".to_string(),
            names_key: "topics:names".to_string(),
        }
    }
}

/// A topic and its approximate count
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicCount {
    pub topic: String,
    pub count: u64,
}

/// Counts topic mentions per hour and answers top-K queries
#[derive(Clone)]
pub struct TopicTracker {
    sketches: Arc<dyn SketchStore>,
    config: TrackerConfig,
}

impl TopicTracker {
    pub fn new(sketches: Arc<dyn SketchStore>, config: TrackerConfig) -> Self {
        Self { sketches, config }
    }

    pub fn sketch_key(&self, bucket: TimeBucket) -> String {
        format!("{}{}", self.config.sketch_prefix, bucket.label())
    }

    /// Set of the topics seen in one bucket
    pub fn bucket_names_key(&self, bucket: TimeBucket) -> String {
        format!("{}:{}", self.config.names_key, bucket.label())
    }

    /// Make sure the bucket's sketch exists; an existing one is fine
    pub async fn ensure_bucket(&self, bucket: TimeBucket) -> PipelineResult<()> {
        let key = self.sketch_key(bucket);
        tolerate_exists(
            self.sketches
                .init_by_dim(&key, self.config.width, self.config.depth)
                .await,
            "topic sketch",
        )
    }

    /// Count each topic once per mention in the bucket and remember its name
    pub async fn record(&self, topics: &[String], bucket: TimeBucket) -> PipelineResult<()> {
        if topics.is_empty() {
            return Ok(());
        }

        let mut counts: Vec<(String, u64)> = Vec::new();
        for topic in topics {
            match counts.iter_mut().find(|(name, _)| name == topic) {
                Some((_, n)) => *n += 1,
                None => counts.push((topic.clone(), 1)),
            }
        }

        self.ensure_bucket(bucket).await?;
        let key = self.sketch_key(bucket);
        self.sketches.incr_by(&key, &counts).await?;

        let names: Vec<String> = counts.into_iter().map(|(name, _)| name).collect();
        self.sketches
            .add_names(&self.bucket_names_key(bucket), &names)
            .await?;
        self.sketches.add_names(&self.config.names_key, &names).await?;

        debug!("Recorded {} topics in {}", names.len(), key);
        Ok(())
    }

    /// Every topic name ever recorded
    pub async fn known_topics(&self) -> PipelineResult<Vec<String>> {
        self.sketches.names(&self.config.names_key).await
    }

    /// Topics seen in the bucket ranked by approximate count
    ///
    /// Read-only: a bucket nobody wrote to has neither names nor a sketch.
    pub async fn top_k_with_counts(&self, bucket: TimeBucket, k: usize) -> PipelineResult<Vec<TopicCount>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let names = self.sketches.names(&self.bucket_names_key(bucket)).await?;
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let counts = self.sketches.query(&self.sketch_key(bucket), &names).await?;

        let by_name: HashMap<&str, u64> = names
            .iter()
            .map(String::as_str)
            .zip(counts.iter().copied())
            .collect();

        let mut ranked: Vec<TopicCount> = by_name
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(topic, count)| TopicCount {
                topic: topic.to_string(),
                count,
            })
            .collect();
        ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.topic.cmp(&b.topic)));
        ranked.truncate(k);
        Ok(ranked)
    }

    pub async fn top_k_for_bucket(&self, bucket: TimeBucket, k: usize) -> PipelineResult<Vec<String>> {
        Ok(self
            .top_k_with_counts(bucket, k)
            .await?
            .into_iter()
            .map(|t| t.topic)
            .collect())
    }
}
