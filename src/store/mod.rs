/// Backing store abstractions
///
/// The pipeline talks to its durable state through four seams:
/// - `StreamStore`: append log with consumer groups, plus the atomic ack + mark-seen
/// - `FilterStore`: named membership filters used for deduplication
/// - `SketchStore`: count-min sketches and the topic name set
/// - `IndexStore`: upsert-by-key persistence of kept events
///
/// `RedisStore` implements all of them against Redis Stack; `MemoryStore`
/// implements them in-process for tests and demo runs.

pub mod bloom;
pub mod memory;
pub mod redis_store;
pub mod sketch;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::error::{PipelineError, PipelineResult};
use crate::event::StreamEntry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Which part of a consumer group to read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to any consumer of the group (`>`)
    New,
    /// Entries already delivered to this consumer but not acknowledged (`0`)
    Pending,
}

impl ReadCursor {
    pub fn as_id(&self) -> &'static str {
        match self {
            ReadCursor::New => ">",
            ReadCursor::Pending => "0",
        }
    }
}

/// Consumer group read parameters
#[derive(Debug, Clone)]
pub struct ReadRequest<'a> {
    pub stream: &'a str,
    pub group: &'a str,
    pub consumer: &'a str,
    pub count: usize,
    /// Only honoured for `ReadCursor::New`; pending reads never block
    pub block: Duration,
    pub cursor: ReadCursor,
}

/// Target of the atomic acknowledge + mark-seen step
#[derive(Debug, Clone)]
pub struct AckAndMark<'a> {
    pub stream: &'a str,
    pub group: &'a str,
    pub entry_id: &'a str,
    pub filter: &'a str,
    pub key: &'a str,
}

/// Append log with consumer-group semantics
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Create the group (and the stream if missing). "Already exists" is
    /// reported as `PipelineError::AlreadyExists`.
    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> PipelineResult<()>;

    async fn read_group(&self, request: &ReadRequest<'_>) -> PipelineResult<Vec<StreamEntry>>;

    /// Acknowledge an entry; returns how many entries were actually acked
    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> PipelineResult<u64>;

    /// Append an entry, trimming the stream to exactly `max_len` when given
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: Option<usize>,
    ) -> PipelineResult<String>;

    /// Acknowledge the entry and add the key to the filter as one unit
    async fn ack_and_mark(&self, target: &AckAndMark<'_>) -> PipelineResult<()>;

    /// Number of delivered-but-unacked entries for the group
    async fn pending_count(&self, stream: &str, group: &str) -> PipelineResult<u64>;

    /// Current number of entries in the stream
    async fn stream_len(&self, stream: &str) -> PipelineResult<u64>;

    async fn ping(&self) -> PipelineResult<()>;
}

/// Probabilistic membership filter
#[async_trait]
pub trait FilterStore: Send + Sync {
    async fn reserve(
        &self,
        name: &str,
        error_rate: f64,
        capacity: u64,
        expansion: u32,
    ) -> PipelineResult<()>;

    async fn exists(&self, name: &str, key: &str) -> PipelineResult<bool>;

    /// Returns true when the key was newly added
    async fn add(&self, name: &str, key: &str) -> PipelineResult<bool>;
}

/// Count-min sketches plus a name set for enumeration
#[async_trait]
pub trait SketchStore: Send + Sync {
    async fn init_by_dim(&self, name: &str, width: u32, depth: u32) -> PipelineResult<()>;

    async fn incr_by(&self, name: &str, items: &[(String, u64)]) -> PipelineResult<()>;

    /// A missing sketch counts every item as zero
    async fn query(&self, name: &str, items: &[String]) -> PipelineResult<Vec<u64>>;

    async fn add_names(&self, set: &str, names: &[String]) -> PipelineResult<()>;

    async fn names(&self, set: &str) -> PipelineResult<Vec<String>>;
}

/// Keyed persistence of processed events
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert or overwrite the fields stored under `key`
    async fn upsert(&self, key: &str, fields: &[(&str, String)]) -> PipelineResult<()>;

    async fn fetch(&self, key: &str) -> PipelineResult<Option<HashMap<String, String>>>;
}

/// Treat "already exists" on an init call as success
pub fn tolerate_exists(result: PipelineResult<()>, what: &str) -> PipelineResult<()> {
    match result {
        Err(PipelineError::AlreadyExists(name)) => {
            debug!("{} {} already exists", what, name);
            Ok(())
        }
        other => other,
    }
}

/// Create a consumer group, tolerating an existing one
pub async fn ensure_group(
    store: &dyn StreamStore,
    stream: &str,
    group: &str,
    start_id: &str,
) -> PipelineResult<()> {
    tolerate_exists(store.create_group(stream, group, start_id).await, "consumer group")
}

/// Reserve a membership filter, tolerating an existing one
pub async fn ensure_filter(
    store: &dyn FilterStore,
    name: &str,
    error_rate: f64,
    capacity: u64,
    expansion: u32,
) -> PipelineResult<()> {
    tolerate_exists(
        store.reserve(name, error_rate, capacity, expansion).await,
        "membership filter",
    )
}
