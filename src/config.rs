/// Configuration management for skystream
use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub streams: StreamsConfig,
    pub runner: RunnerConfig,
    pub filter: FilterConfig,
    pub sketch: SketchConfig,
    pub classifier: ClassifierConfig,
    pub topics: TopicsConfig,
    pub languages: LanguageConfig,
    pub routing: RoutingConfig,
    pub api: ApiConfig,
    pub firehose: FirehoseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(PipelineError::Config(format!(
                "STORE_BACKEND must be redis or memory, got '{}'",
                other
            ))),
        }
    }
}

/// Store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
}

/// Stream, group, filter and key names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsConfig {
    pub raw: String,
    pub raw_max_len: usize,
    pub filtered: String,
    pub filtered_max_len: usize,
    pub ingest_group: String,
    pub enrich_group: String,
    pub ingest_filter: String,
    pub enrich_filter: String,
    /// Prefix of the hash each persisted event is stored under
    pub record_prefix: String,
    /// Start id for newly created groups
    pub group_start: String,
}

/// Runner pools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Entries requested per poll
    pub count: usize,
    pub block: Duration,
    /// None keeps runners going until shutdown
    pub idle_stop: Option<Duration>,
    pub limit: Option<u64>,
    pub ingest_workers: usize,
    pub enrich_workers: usize,
    /// Consumer names are `{prefix}-{pipeline}-{index}`; keep it stable
    /// across restarts so pending entries are picked up again
    pub consumer_prefix: String,
}

/// Membership filter sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub error_rate: f64,
    pub capacity: u64,
    pub expansion: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SketchConfig {
    pub width: u32,
    pub depth: u32,
}

/// Content classification stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub labels: Vec<String>,
    pub threshold: f64,
}

/// Topic extraction stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub model: String,
    pub max_topics: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    /// Empty disables the language stage
    pub allowed: Vec<String>,
}

/// Query routing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub url: Option<String>,
    pub min_score: f64,
    /// Timeout for every model and routing HTTP call
    pub http_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

/// Jetstream producer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirehoseConfig {
    pub enabled: bool,
    pub jetstream_url: String,
    pub reconnect_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

/// Typed reads over a variable lookup
struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set and non-blank
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, name: &str, default: T) -> PipelineResult<T> {
        match self.optional(name) {
            Some(raw) => raw
                .parse()
                .map_err(|_| PipelineError::Config(format!("Invalid value for {}: '{}'", name, raw))),
            None => Ok(default),
        }
    }

    fn parse_optional<T: FromStr>(&self, name: &str) -> PipelineResult<Option<T>> {
        self.optional(name)
            .map(|raw| {
                raw.parse()
                    .map_err(|_| PipelineError::Config(format!("Invalid value for {}: '{}'", name, raw)))
            })
            .transpose()
    }

    fn flag(&self, name: &str, default: bool) -> PipelineResult<bool> {
        match self.optional(name).map(|v| v.to_ascii_lowercase()) {
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(PipelineError::Config(format!("Invalid flag for {}: '{}'", name, v))),
            None => Ok(default),
        }
    }

    /// Comma separated; unset falls back to `default`, set-but-blank is empty
    fn list(&self, name: &str, default: &[&str]) -> Vec<String> {
        match (self.lookup)(name) {
            Some(raw) => raw
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
            None => default.iter().map(|item| item.to_string()).collect(),
        }
    }

    fn millis(&self, name: &str, default: u64) -> PipelineResult<Duration> {
        Ok(Duration::from_millis(self.parse(name, default)?))
    }
}

impl PipelineConfig {
    /// Load configuration from the process environment (and `.env`)
    pub fn from_env() -> PipelineResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load from a fixed map of variables
    pub fn from_map(vars: &HashMap<String, String>) -> PipelineResult<Self> {
        Self::from_lookup(|name| vars.get(name).cloned())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> PipelineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let store = StoreConfig {
            backend: vars.parse("STORE_BACKEND", StoreBackend::Redis)?,
            redis_url: vars.string("REDIS_URL", "redis://127.0.0.1:6379"),
        };

        let streams = StreamsConfig {
            raw: vars.string("STREAM_RAW", "firehose:raw"),
            raw_max_len: vars.parse("STREAM_RAW_MAXLEN", 100_000)?,
            filtered: vars.string("STREAM_FILTERED", "firehose:filtered"),
            filtered_max_len: vars.parse("STREAM_FILTERED_MAXLEN", 100_000)?,
            ingest_group: vars.string("INGEST_GROUP", "ingest"),
            enrich_group: vars.string("ENRICH_GROUP", "enrich"),
            ingest_filter: vars.string("INGEST_FILTER", "bf:ingest-dedup"),
            enrich_filter: vars.string("ENRICH_FILTER", "bf:post-filter-dedup"),
            record_prefix: vars.string("RECORD_PREFIX", "post:"),
            group_start: vars.string("STREAM_GROUP_START", "0"),
        };

        let runner = RunnerConfig {
            count: vars.parse("RUNNER_COUNT", 10)?,
            block: vars.millis("RUNNER_BLOCK_MS", 1000)?,
            idle_stop: vars
                .parse_optional::<u64>("RUNNER_IDLE_STOP_MS")?
                .map(Duration::from_millis),
            limit: vars.parse_optional("RUNNER_LIMIT")?,
            ingest_workers: vars.parse("INGEST_WORKERS", 2)?,
            enrich_workers: vars.parse("ENRICH_WORKERS", 2)?,
            consumer_prefix: vars.string("CONSUMER_PREFIX", "skystream"),
        };

        let filter = FilterConfig {
            error_rate: vars.parse("FILTER_ERROR_RATE", 0.01)?,
            capacity: vars.parse("FILTER_CAPACITY", 1_000_000)?,
            expansion: vars.parse("FILTER_EXPANSION", 2)?,
        };

        let sketch = SketchConfig {
            width: vars.parse("SKETCH_WIDTH", 2000)?,
            depth: vars.parse("SKETCH_DEPTH", 5)?,
        };

        let classifier = ClassifierConfig {
            enabled: vars.flag("CLASSIFIER_ENABLED", true)?,
            url: vars.optional("CLASSIFIER_URL"),
            labels: vars.list("CLASSIFIER_LABELS", &["news", "politics", "technology", "science"]),
            threshold: vars.parse("CLASSIFIER_THRESHOLD", 0.90)?,
        };

        let topics = TopicsConfig {
            enabled: vars.flag("TOPICS_ENABLED", true)?,
            url: vars.optional("TOPICS_URL"),
            model: vars.string("TOPICS_MODEL", "llama3.2"),
            max_topics: vars.parse("TOPICS_MAX", 5)?,
        };

        let languages = LanguageConfig {
            allowed: vars.list("LANGUAGES_ALLOWED", &["en"]),
        };

        let routing = RoutingConfig {
            url: vars.optional("ROUTER_URL"),
            min_score: vars.parse("ROUTER_MIN_SCORE", 0.5)?,
            http_timeout: Duration::from_secs(vars.parse("HTTP_TIMEOUT_SECS", 30)?),
        };

        let api = ApiConfig {
            enabled: vars.flag("API_ENABLED", true)?,
            host: vars.string("API_HOST", "0.0.0.0"),
            port: vars.parse("API_PORT", 8080)?,
        };

        let firehose = FirehoseConfig {
            enabled: vars.flag("FIREHOSE_ENABLED", true)?,
            jetstream_url: vars.string("JETSTREAM_URL", "wss://jetstream2.us-east.bsky.network"),
            reconnect_interval: Duration::from_secs(vars.parse("FIREHOSE_RECONNECT_SECS", 5)?),
        };

        let logging = LoggingConfig {
            filter: vars.string("RUST_LOG", "skystream=info"),
            json: vars.string("LOG_FORMAT", "text").eq_ignore_ascii_case("json"),
        };

        Ok(Self {
            store,
            streams,
            runner,
            filter,
            sketch,
            classifier,
            topics,
            languages,
            routing,
            api,
            firehose,
            logging,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> PipelineResult<()> {
        if !(self.filter.error_rate > 0.0 && self.filter.error_rate < 1.0) {
            return Err(PipelineError::Config(format!(
                "FILTER_ERROR_RATE must be in (0, 1), got {}",
                self.filter.error_rate
            )));
        }
        if self.filter.capacity == 0 {
            return Err(PipelineError::Config("FILTER_CAPACITY must be positive".to_string()));
        }
        if self.filter.expansion == 0 {
            return Err(PipelineError::Config("FILTER_EXPANSION must be positive".to_string()));
        }
        if self.sketch.width == 0 || self.sketch.depth == 0 {
            return Err(PipelineError::Config(
                "SKETCH_WIDTH and SKETCH_DEPTH must be positive".to_string(),
            ));
        }
        if self.runner.count == 0 {
            return Err(PipelineError::Config("RUNNER_COUNT must be positive".to_string()));
        }
        if self.runner.ingest_workers == 0 || self.runner.enrich_workers == 0 {
            return Err(PipelineError::Config(
                "INGEST_WORKERS and ENRICH_WORKERS must be positive".to_string(),
            ));
        }
        if self.streams.raw_max_len == 0 || self.streams.filtered_max_len == 0 {
            return Err(PipelineError::Config("Stream caps must be positive".to_string()));
        }

        if self.classifier.enabled {
            require_url("CLASSIFIER_URL", self.classifier.url.as_deref())?;
            if self.classifier.labels.is_empty() {
                return Err(PipelineError::Config(
                    "CLASSIFIER_LABELS cannot be empty".to_string(),
                ));
            }
        }
        if self.topics.enabled {
            require_url("TOPICS_URL", self.topics.url.as_deref())?;
            if self.topics.max_topics == 0 {
                return Err(PipelineError::Config("TOPICS_MAX must be positive".to_string()));
            }
        }
        if let Some(url) = self.routing.url.as_deref() {
            require_url("ROUTER_URL", Some(url))?;
        }
        if self.firehose.enabled
            && !(self.firehose.jetstream_url.starts_with("ws://")
                || self.firehose.jetstream_url.starts_with("wss://"))
        {
            return Err(PipelineError::Config(format!(
                "JETSTREAM_URL must be a ws:// or wss:// url, got '{}'",
                self.firehose.jetstream_url
            )));
        }

        Ok(())
    }
}

fn require_url(name: &str, value: Option<&str>) -> PipelineResult<()> {
    match value {
        None => Err(PipelineError::Config(format!(
            "{} is required when its stage is enabled",
            name
        ))),
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => Ok(()),
        Some(url) => Err(PipelineError::Config(format!(
            "{} must be an http(s) url, got '{}'",
            name, url
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> PipelineResult<PipelineConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_map(&vars)
    }

    fn endpoints() -> Vec<(&'static str, &'static str)> {
        vec![
            ("CLASSIFIER_URL", "http://classifier:8000/classify"),
            ("TOPICS_URL", "http://ollama:11434"),
        ]
    }

    #[test]
    fn test_defaults() {
        let config = config(&endpoints()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.streams.raw, "firehose:raw");
        assert_eq!(config.streams.filtered, "firehose:filtered");
        assert_eq!(config.streams.ingest_filter, "bf:ingest-dedup");
        assert_eq!(config.streams.enrich_filter, "bf:post-filter-dedup");
        assert_eq!(config.streams.group_start, "0");
        assert_eq!(config.runner.idle_stop, None);
        assert_eq!(config.runner.limit, None);
        assert_eq!(config.filter.error_rate, 0.01);
        assert_eq!(config.sketch.width, 2000);
        assert_eq!(config.sketch.depth, 5);
        assert_eq!(config.classifier.threshold, 0.90);
        assert_eq!(config.topics.max_topics, 5);
        assert_eq!(config.languages.allowed, vec!["en"]);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_overrides() {
        let mut pairs = endpoints();
        pairs.extend([
            ("STORE_BACKEND", "memory"),
            ("RUNNER_IDLE_STOP_MS", "2000"),
            ("RUNNER_LIMIT", "3"),
            ("LANGUAGES_ALLOWED", "en, ja"),
            ("LOG_FORMAT", "JSON"),
        ]);
        let config = config(&pairs).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.runner.idle_stop, Some(Duration::from_millis(2000)));
        assert_eq!(config.runner.limit, Some(3));
        assert_eq!(config.languages.allowed, vec!["en", "ja"]);
        assert!(config.logging.json);
    }

    #[test]
    fn test_blank_language_list_disables_stage() {
        let mut pairs = endpoints();
        pairs.push(("LANGUAGES_ALLOWED", ""));
        assert!(config(&pairs).unwrap().languages.allowed.is_empty());
    }

    #[test]
    fn test_invalid_number_is_fatal() {
        let mut pairs = endpoints();
        pairs.push(("RUNNER_BLOCK_MS", "soon"));
        assert!(matches!(config(&pairs), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_enabled_stage_needs_endpoint() {
        let missing = config(&[("TOPICS_URL", "http://ollama:11434")]).unwrap();
        assert!(missing.validate().is_err());

        let disabled = config(&[
            ("CLASSIFIER_ENABLED", "false"),
            ("TOPICS_URL", "http://ollama:11434"),
        ])
        .unwrap();
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        let mut pairs = endpoints();
        pairs.push(("FILTER_ERROR_RATE", "1.5"));
        assert!(config(&pairs).unwrap().validate().is_err());

        let mut pairs = endpoints();
        pairs.push(("INGEST_WORKERS", "0"));
        assert!(config(&pairs).unwrap().validate().is_err());
    }
}
