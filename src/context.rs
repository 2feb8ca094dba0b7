/// Application context and dependency injection
use crate::{
    config::{PipelineConfig, StoreBackend},
    error::{PipelineError, PipelineResult},
    handlers::{
        Classifier, ClassifyHandler, DedupHandler, ExtractTopicsHandler, HttpClassifier,
        HttpTopicExtractor, LanguageHandler, PersistHandler, RepublishHandler, TopicExtractor,
    },
    pipeline::{AckTarget, Handler, HandlerChain, RunnerOptions},
    routing::{HttpRouteMatcher, RouteMatcher},
    store::{
        ensure_filter, ensure_group, FilterStore, IndexStore, MemoryStore, RedisStore, SketchStore,
        StreamStore,
    },
    topics::{TopicTracker, TrackerConfig},
};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

pub const INGEST_PIPELINE: &str = "ingest";
pub const ENRICH_PIPELINE: &str = "enrich";

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<PipelineConfig>,
    pub log: Arc<dyn StreamStore>,
    pub filters: Arc<dyn FilterStore>,
    pub index: Arc<dyn IndexStore>,
    pub tracker: TopicTracker,
    pub classifier: Option<Arc<dyn Classifier>>,
    pub extractor: Option<Arc<dyn TopicExtractor>>,
    pub router: Option<Arc<dyn RouteMatcher>>,
    pub started_at: Instant,
}

impl AppContext {
    /// Validate configuration, connect the store and build the model clients
    pub async fn new(config: PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;

        let ctx = match config.store.backend {
            StoreBackend::Redis => {
                let store = Arc::new(RedisStore::connect(&config.store.redis_url).await?);
                Self::with_store(config, store)
            }
            StoreBackend::Memory => {
                info!("Using in-memory store; nothing survives a restart");
                Self::with_store(config, Arc::new(MemoryStore::new()))
            }
        };

        ctx.with_http_services()
    }

    /// Context over one store implementing every store trait, no model clients
    pub fn with_store<S>(config: PipelineConfig, store: Arc<S>) -> Self
    where
        S: StreamStore + FilterStore + SketchStore + IndexStore + 'static,
    {
        let tracker = TopicTracker::new(
            store.clone(),
            TrackerConfig {
                width: config.sketch.width,
                depth: config.sketch.depth,
                ..TrackerConfig::default()
            },
        );

        Self {
            config: Arc::new(config),
            log: store.clone(),
            filters: store.clone(),
            index: store,
            tracker,
            classifier: None,
            extractor: None,
            router: None,
            started_at: Instant::now(),
        }
    }

    /// Build HTTP clients for every enabled model stage
    fn with_http_services(mut self) -> PipelineResult<Self> {
        let timeout = self.config.routing.http_timeout;

        if self.config.classifier.enabled {
            if let Some(url) = &self.config.classifier.url {
                self.classifier = Some(Arc::new(HttpClassifier::new(url.clone(), timeout)?));
                info!("✓ Classifier endpoint: {}", url);
            }
        }
        if self.config.topics.enabled {
            if let Some(url) = &self.config.topics.url {
                self.extractor = Some(Arc::new(HttpTopicExtractor::new(
                    url.clone(),
                    self.config.topics.model.clone(),
                    self.config.topics.max_topics,
                    timeout,
                )?));
                info!("✓ Topic model: {} at {}", self.config.topics.model, url);
            }
        }
        if let Some(url) = &self.config.routing.url {
            self.router = Some(Arc::new(HttpRouteMatcher::new(
                url.clone(),
                self.config.routing.min_score,
                timeout,
            )?));
            info!("✓ Route search endpoint: {}", url);
        }

        Ok(self)
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn TopicExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_router(mut self, router: Arc<dyn RouteMatcher>) -> Self {
        self.router = Some(router);
        self
    }

    /// Create consumer groups and reserve filters; existing ones are kept
    pub async fn prepare(&self) -> PipelineResult<()> {
        let streams = &self.config.streams;
        let filter = &self.config.filter;

        ensure_group(self.log.as_ref(), &streams.raw, &streams.ingest_group, &streams.group_start)
            .await?;
        ensure_group(
            self.log.as_ref(),
            &streams.filtered,
            &streams.enrich_group,
            &streams.group_start,
        )
        .await?;

        for name in [&streams.ingest_filter, &streams.enrich_filter] {
            ensure_filter(
                self.filters.as_ref(),
                name,
                filter.error_rate,
                filter.capacity,
                filter.expansion,
            )
            .await?;
        }

        info!("✓ Consumer groups and filters ready");
        Ok(())
    }

    /// dedup -> language -> classify -> republish
    pub fn ingest_chain(&self) -> PipelineResult<HandlerChain> {
        let streams = &self.config.streams;
        let mut handlers: Vec<Arc<dyn Handler>> = vec![Arc::new(DedupHandler::new(
            self.filters.clone(),
            streams.ingest_filter.clone(),
        ))];

        if !self.config.languages.allowed.is_empty() {
            handlers.push(Arc::new(LanguageHandler::new(&self.config.languages.allowed)));
        }

        if self.config.classifier.enabled {
            let classifier = self.classifier.clone().ok_or_else(|| {
                PipelineError::Config("classifier stage enabled without a classifier".to_string())
            })?;
            handlers.push(Arc::new(ClassifyHandler::new(
                classifier,
                self.config.classifier.labels.clone(),
                self.config.classifier.threshold,
            )));
        }

        handlers.push(Arc::new(RepublishHandler::new(
            self.log.clone(),
            streams.filtered.clone(),
            streams.filtered_max_len,
        )));

        HandlerChain::new(
            INGEST_PIPELINE,
            handlers,
            self.log.clone(),
            AckTarget {
                stream: streams.raw.clone(),
                group: streams.ingest_group.clone(),
                filter: streams.ingest_filter.clone(),
            },
        )
    }

    /// dedup -> extract-topics -> persist
    pub fn enrich_chain(&self) -> PipelineResult<HandlerChain> {
        let streams = &self.config.streams;
        let mut handlers: Vec<Arc<dyn Handler>> = vec![Arc::new(DedupHandler::new(
            self.filters.clone(),
            streams.enrich_filter.clone(),
        ))];

        if self.config.topics.enabled {
            let extractor = self.extractor.clone().ok_or_else(|| {
                PipelineError::Config("topic stage enabled without an extractor".to_string())
            })?;
            handlers.push(Arc::new(ExtractTopicsHandler::new(
                extractor,
                self.tracker.clone(),
                self.config.topics.max_topics,
            )));
        }

        handlers.push(Arc::new(PersistHandler::new(
            self.index.clone(),
            streams.record_prefix.clone(),
        )));

        HandlerChain::new(
            ENRICH_PIPELINE,
            handlers,
            self.log.clone(),
            AckTarget {
                stream: streams.filtered.clone(),
                group: streams.enrich_group.clone(),
                filter: streams.enrich_filter.clone(),
            },
        )
    }

    pub fn runner_options(&self) -> RunnerOptions {
        let runner = &self.config.runner;
        RunnerOptions {
            count: runner.count,
            block: runner.block,
            idle_stop: runner.idle_stop,
            limit: runner.limit,
            start_id: self.config.streams.group_start.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn memory_context(pairs: &[(&str, &str)]) -> AppContext {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = PipelineConfig::from_map(&vars).unwrap();
        AppContext::with_store(config, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_chains_follow_enabled_stages() {
        let ctx = memory_context(&[("CLASSIFIER_ENABLED", "false"), ("TOPICS_ENABLED", "false")]);

        let ingest = ctx.ingest_chain().unwrap();
        assert_eq!(ingest.handler_names(), vec!["dedup", "language", "republish"]);
        assert_eq!(ingest.target().stream, "firehose:raw");

        let enrich = ctx.enrich_chain().unwrap();
        assert_eq!(enrich.handler_names(), vec!["dedup", "persist"]);
        assert_eq!(enrich.target().filter, "bf:post-filter-dedup");
    }

    #[test]
    fn test_enabled_stage_without_client_is_config_error() {
        let ctx = memory_context(&[]);
        assert!(matches!(ctx.ingest_chain(), Err(PipelineError::Config(_))));
        assert!(matches!(ctx.enrich_chain(), Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let ctx = memory_context(&[]);
        ctx.prepare().await.unwrap();
        ctx.prepare().await.unwrap();
        assert_eq!(ctx.log.pending_count("firehose:raw", "ingest").await.unwrap(), 0);
    }
}
