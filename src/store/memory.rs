/// In-process implementation of every store seam
///
/// Behaves like the Redis backend where the pipeline depends on it: consumer
/// groups with per-consumer pending lists, exact MAXLEN trimming, idempotent
/// acks, scalable Bloom filters and count-min sketches. Fault injection hooks
/// let tests fail the atomic ack + mark step and group reads.
use crate::{
    error::{PipelineError, PipelineResult},
    event::StreamEntry,
    store::{
        bloom::ScalableBloomFilter, sketch::CountMinSketch, AckAndMark, FilterStore, IndexStore,
        ReadCursor, ReadRequest, SketchStore, StreamStore,
    },
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;

// filters created implicitly by an add, matching BF.ADD defaults
const DEFAULT_ERROR_RATE: f64 = 0.01;
const DEFAULT_CAPACITY: u64 = 100;
const DEFAULT_EXPANSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
struct EntryId {
    ms: u64,
    seq: u64,
}

impl EntryId {
    fn parse(raw: &str) -> PipelineResult<Self> {
        let invalid = || PipelineError::Decode(format!("invalid stream id '{}'", raw));
        let (ms, seq) = match raw.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (raw, "0"),
        };
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

struct PendingEntry {
    consumer: String,
    deliveries: u32,
}

#[derive(Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    entries: VecDeque<(EntryId, HashMap<String, String>)>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn next_id(&self) -> EntryId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        if now_ms > self.last_id.ms {
            EntryId { ms: now_ms, seq: 0 }
        } else {
            EntryId {
                ms: self.last_id.ms,
                seq: self.last_id.seq + 1,
            }
        }
    }

    fn fields_of(&self, id: EntryId) -> Option<&HashMap<String, String>> {
        self.entries
            .binary_search_by(|(entry_id, _)| entry_id.cmp(&id))
            .ok()
            .map(|index| &self.entries[index].1)
    }
}

#[derive(Default)]
struct MemoryState {
    streams: HashMap<String, StreamState>,
    filters: HashMap<String, ScalableBloomFilter>,
    sketches: HashMap<String, CountMinSketch>,
    sets: HashMap<String, BTreeSet<String>>,
    index: HashMap<String, HashMap<String, String>>,
    acknowledgements: HashMap<String, u32>,
    upserts: u64,
}

/// In-memory store backend
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    appended: Notify,
    ack_and_mark_faults: AtomicU32,
    read_faults: AtomicU32,
}

fn no_group(stream: &str, group: &str) -> PipelineError {
    PipelineError::Internal(format!(
        "NOGROUP No such key '{}' or consumer group '{}'",
        stream, group
    ))
}

fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> PipelineResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| PipelineError::Internal("memory store lock poisoned".to_string()))
    }

    /// Fail the next `n` ack + mark calls before anything is applied
    pub fn inject_ack_and_mark_faults(&self, n: u32) {
        self.ack_and_mark_faults.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` group reads
    pub fn inject_read_faults(&self, n: u32) {
        self.read_faults.store(n, Ordering::SeqCst);
    }

    /// How many times an ack (plain or atomic) was issued for an entry
    pub fn acknowledgements(&self, entry_id: &str) -> u32 {
        self.state()
            .map(|s| s.acknowledgements.get(entry_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Total number of index upserts applied
    pub fn upsert_count(&self) -> u64 {
        self.state().map(|s| s.upserts).unwrap_or(0)
    }

    fn try_read(&self, request: &ReadRequest<'_>) -> PipelineResult<Vec<StreamEntry>> {
        let mut state = self.state()?;
        let stream = state
            .streams
            .get_mut(request.stream)
            .ok_or_else(|| no_group(request.stream, request.group))?;
        let StreamState {
            entries, groups, ..
        } = stream;
        let group = groups
            .get_mut(request.group)
            .ok_or_else(|| no_group(request.stream, request.group))?;

        let mut delivered = Vec::new();
        match request.cursor {
            ReadCursor::New => {
                let after = group.last_delivered;
                for (id, fields) in entries.iter().filter(|(id, _)| *id > after) {
                    if delivered.len() >= request.count {
                        break;
                    }
                    group.pending.insert(
                        *id,
                        PendingEntry {
                            consumer: request.consumer.to_string(),
                            deliveries: 1,
                        },
                    );
                    group.last_delivered = *id;
                    delivered.push(StreamEntry::new(id.to_string(), fields.clone()));
                }
            }
            ReadCursor::Pending => {
                let ids: Vec<EntryId> = group
                    .pending
                    .iter()
                    .filter(|(_, p)| p.consumer == request.consumer)
                    .map(|(id, _)| *id)
                    .take(request.count)
                    .collect();
                for id in ids {
                    if let Some(pending) = group.pending.get_mut(&id) {
                        pending.deliveries += 1;
                    }
                    // trimmed entries come back with no fields, as in Redis
                    let fields = entries
                        .binary_search_by(|(entry_id, _)| entry_id.cmp(&id))
                        .ok()
                        .map(|index| entries[index].1.clone())
                        .unwrap_or_default();
                    delivered.push(StreamEntry::new(id.to_string(), fields));
                }
            }
        }

        Ok(delivered)
    }

    fn apply_ack(state: &mut MemoryState, stream: &str, group: &str, entry_id: &str) -> PipelineResult<u64> {
        let id = EntryId::parse(entry_id)?;
        *state
            .acknowledgements
            .entry(entry_id.to_string())
            .or_insert(0) += 1;

        let removed = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .and_then(|g| g.pending.remove(&id))
            .is_some();
        Ok(u64::from(removed))
    }

    fn append_sync(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: Option<usize>,
    ) -> PipelineResult<String> {
        let mut state = self.state()?;
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        let id = stream_state.next_id();
        let map = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        stream_state.entries.push_back((id, map));
        stream_state.last_id = id;

        if let Some(max_len) = max_len {
            while stream_state.entries.len() > max_len {
                stream_state.entries.pop_front();
            }
        }

        Ok(id.to_string())
    }

    fn ack_and_mark_sync(&self, target: &AckAndMark<'_>) -> PipelineResult<()> {
        let mut state = self.state()?;
        // validate before mutating so the pair applies fully or not at all
        EntryId::parse(target.entry_id)?;
        state
            .filters
            .entry(target.filter.to_string())
            .or_insert_with(|| {
                ScalableBloomFilter::new(DEFAULT_ERROR_RATE, DEFAULT_CAPACITY, DEFAULT_EXPANSION)
            })
            .insert(target.key);
        Self::apply_ack(&mut state, target.stream, target.group, target.entry_id)?;
        Ok(())
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> PipelineResult<()> {
        let mut state = self.state()?;
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        if stream_state.groups.contains_key(group) {
            return Err(PipelineError::AlreadyExists(format!("{}/{}", stream, group)));
        }
        let last_delivered = match start_id {
            "$" => stream_state.last_id,
            other => EntryId::parse(other)?,
        };
        stream_state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn read_group(&self, request: &ReadRequest<'_>) -> PipelineResult<Vec<StreamEntry>> {
        if take_fault(&self.read_faults) {
            return Err(PipelineError::Internal("injected read fault".to_string()));
        }

        let deadline = Instant::now() + request.block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.try_read(request)?;
            if !entries.is_empty()
                || request.cursor == ReadCursor::Pending
                || request.block.is_zero()
            {
                return Ok(entries);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> PipelineResult<u64> {
        let mut state = self.state()?;
        Self::apply_ack(&mut state, stream, group, entry_id)
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: Option<usize>,
    ) -> PipelineResult<String> {
        let id = self.append_sync(stream, fields, max_len)?;
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ack_and_mark(&self, target: &AckAndMark<'_>) -> PipelineResult<()> {
        if take_fault(&self.ack_and_mark_faults) {
            return Err(PipelineError::Internal(
                "injected ack_and_mark fault".to_string(),
            ));
        }
        self.ack_and_mark_sync(target)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> PipelineResult<u64> {
        let state = self.state()?;
        Ok(state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len() as u64)
            .unwrap_or(0))
    }

    async fn stream_len(&self, stream: &str) -> PipelineResult<u64> {
        let state = self.state()?;
        Ok(state
            .streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn ping(&self) -> PipelineResult<()> {
        self.state().map(|_| ())
    }
}

#[async_trait]
impl FilterStore for MemoryStore {
    async fn reserve(
        &self,
        name: &str,
        error_rate: f64,
        capacity: u64,
        expansion: u32,
    ) -> PipelineResult<()> {
        let mut state = self.state()?;
        if state.filters.contains_key(name) {
            return Err(PipelineError::AlreadyExists(name.to_string()));
        }
        state.filters.insert(
            name.to_string(),
            ScalableBloomFilter::new(error_rate, capacity, expansion),
        );
        Ok(())
    }

    async fn exists(&self, name: &str, key: &str) -> PipelineResult<bool> {
        let state = self.state()?;
        Ok(state
            .filters
            .get(name)
            .map(|f| f.contains(key))
            .unwrap_or(false))
    }

    async fn add(&self, name: &str, key: &str) -> PipelineResult<bool> {
        let mut state = self.state()?;
        Ok(state
            .filters
            .entry(name.to_string())
            .or_insert_with(|| {
                ScalableBloomFilter::new(DEFAULT_ERROR_RATE, DEFAULT_CAPACITY, DEFAULT_EXPANSION)
            })
            .insert(key))
    }
}

#[async_trait]
impl SketchStore for MemoryStore {
    async fn init_by_dim(&self, name: &str, width: u32, depth: u32) -> PipelineResult<()> {
        let mut state = self.state()?;
        if state.sketches.contains_key(name) {
            return Err(PipelineError::AlreadyExists(name.to_string()));
        }
        state
            .sketches
            .insert(name.to_string(), CountMinSketch::new(width, depth));
        Ok(())
    }

    async fn incr_by(&self, name: &str, items: &[(String, u64)]) -> PipelineResult<()> {
        let mut state = self.state()?;
        let sketch = state
            .sketches
            .get_mut(name)
            .ok_or_else(|| PipelineError::Internal(format!("CMS: key '{}' does not exist", name)))?;
        for (item, by) in items {
            sketch.increment(item, *by);
        }
        Ok(())
    }

    async fn query(&self, name: &str, items: &[String]) -> PipelineResult<Vec<u64>> {
        let state = self.state()?;
        Ok(match state.sketches.get(name) {
            Some(sketch) => items.iter().map(|item| sketch.estimate(item)).collect(),
            None => vec![0; items.len()],
        })
    }

    async fn add_names(&self, set: &str, names: &[String]) -> PipelineResult<()> {
        let mut state = self.state()?;
        state
            .sets
            .entry(set.to_string())
            .or_default()
            .extend(names.iter().cloned());
        Ok(())
    }

    async fn names(&self, set: &str) -> PipelineResult<Vec<String>> {
        let state = self.state()?;
        Ok(state
            .sets
            .get(set)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn upsert(&self, key: &str, fields: &[(&str, String)]) -> PipelineResult<()> {
        let mut state = self.state()?;
        let record = state.index.entry(key.to_string()).or_default();
        for (name, value) in fields {
            record.insert(name.to_string(), value.clone());
        }
        state.upserts += 1;
        Ok(())
    }

    async fn fetch(&self, key: &str) -> PipelineResult<Option<HashMap<String, String>>> {
        let state = self.state()?;
        Ok(state.index.get(key).cloned())
    }
}

impl MemoryStore {
    /// Field map of an entry still present in the stream
    pub fn entry_fields(&self, stream: &str, entry_id: &str) -> Option<HashMap<String, String>> {
        let id = EntryId::parse(entry_id).ok()?;
        let state = self.state().ok()?;
        state.streams.get(stream)?.fields_of(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request<'a>(consumer: &'a str, count: usize, cursor: ReadCursor) -> ReadRequest<'a> {
        ReadRequest {
            stream: "s",
            group: "g",
            consumer,
            count,
            block: Duration::ZERO,
            cursor,
        }
    }

    async fn seeded(n: usize) -> MemoryStore {
        let store = MemoryStore::new();
        store.create_group("s", "g", "0").await.unwrap();
        for i in 0..n {
            store
                .append("s", &[("uri", format!("at://x/{}", i))], None)
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_competing_consumers_never_share_entries() {
        let store = seeded(6).await;

        let first = store.read_group(&request("c1", 4, ReadCursor::New)).await.unwrap();
        let second = store.read_group(&request("c2", 4, ReadCursor::New)).await.unwrap();

        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 2);
        assert!(first.iter().all(|e| !second.iter().any(|o| o.id == e.id)));
        assert_eq!(store.pending_count("s", "g").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_successive_reads_resume_after_last_delivered() {
        let store = seeded(5).await;
        let first = store.read_group(&request("c1", 2, ReadCursor::New)).await.unwrap();
        let second = store.read_group(&request("c1", 2, ReadCursor::New)).await.unwrap();
        let third = store.read_group(&request("c1", 2, ReadCursor::New)).await.unwrap();

        let uris: Vec<&str> = first
            .iter()
            .chain(&second)
            .chain(&third)
            .map(|e| e.fields["uri"].as_str())
            .collect();
        assert_eq!(uris, vec!["at://x/0", "at://x/1", "at://x/2", "at://x/3", "at://x/4"]);
        assert_eq!(store.pending_count("s", "g").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() {
        let store = seeded(1).await;
        let entries = store.read_group(&request("c1", 10, ReadCursor::New)).await.unwrap();
        let id = &entries[0].id;

        assert_eq!(store.ack("s", "g", id).await.unwrap(), 1);
        assert_eq!(store.ack("s", "g", id).await.unwrap(), 0);
        assert_eq!(store.pending_count("s", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pending_cursor_redelivers_only_own_entries() {
        let store = seeded(3).await;
        store.read_group(&request("c1", 2, ReadCursor::New)).await.unwrap();
        store.read_group(&request("c2", 1, ReadCursor::New)).await.unwrap();

        let mine = store.read_group(&request("c1", 10, ReadCursor::Pending)).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].fields["uri"], "at://x/0");

        let theirs = store.read_group(&request("c2", 10, ReadCursor::Pending)).await.unwrap();
        assert_eq!(theirs.len(), 1);
        assert_eq!(theirs[0].fields["uri"], "at://x/2");
    }

    #[tokio::test]
    async fn test_append_trims_exactly_to_max_len() {
        let store = MemoryStore::new();
        for i in 0..10 {
            store
                .append("capped", &[("n", i.to_string())], Some(3))
                .await
                .unwrap();
        }
        assert_eq!(store.stream_len("capped").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_ack_and_mark_is_all_or_nothing() {
        let store = seeded(1).await;
        let entries = store.read_group(&request("c1", 1, ReadCursor::New)).await.unwrap();
        let target = AckAndMark {
            stream: "s",
            group: "g",
            entry_id: &entries[0].id,
            filter: "bf",
            key: "at://x/0",
        };

        store.inject_ack_and_mark_faults(1);
        assert!(store.ack_and_mark(&target).await.is_err());
        assert_eq!(store.pending_count("s", "g").await.unwrap(), 1);
        assert!(!store.exists("bf", "at://x/0").await.unwrap());

        store.ack_and_mark(&target).await.unwrap();
        assert_eq!(store.pending_count("s", "g").await.unwrap(), 0);
        assert!(store.exists("bf", "at://x/0").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_init_reports_already_exists() {
        let store = seeded(0).await;
        assert!(store.create_group("s", "g", "0").await.unwrap_err().is_already_exists());

        store.reserve("bf", 0.01, 100, 2).await.unwrap();
        assert!(store.reserve("bf", 0.01, 100, 2).await.unwrap_err().is_already_exists());

        store.init_by_dim("cms", 10, 2).await.unwrap();
        assert!(store.init_by_dim("cms", 10, 2).await.unwrap_err().is_already_exists());
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let store = std::sync::Arc::new(seeded(0).await);
        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                let req = ReadRequest {
                    block: Duration::from_secs(5),
                    ..request("c1", 10, ReadCursor::New)
                };
                store.read_group(&req).await.unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.append("s", &[("uri", "at://late/1".to_string())], None).await.unwrap();

        let entries = reader.await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields["uri"], "at://late/1");
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let store = seeded(0).await;
        let req = ReadRequest {
            block: Duration::from_millis(100),
            ..request("c1", 10, ReadCursor::New)
        };
        let started = std::time::Instant::now();
        assert!(store.read_group(&req).await.unwrap().is_empty());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let store = MemoryStore::new();
        assert!(store.read_group(&request("c1", 1, ReadCursor::New)).await.is_err());
    }
}
