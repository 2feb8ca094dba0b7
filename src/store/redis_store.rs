/// Redis Stack backend
///
/// Streams carry the append log and consumer groups, RedisBloom provides the
/// membership filters (`BF.*`) and count-min sketches (`CMS.*`), and plain
/// hashes hold the persisted events.
use crate::{
    error::{PipelineError, PipelineResult},
    event::StreamEntry,
    store::{
        AckAndMark, FilterStore, IndexStore, ReadCursor, ReadRequest, SketchStore, StreamStore,
    },
};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamMaxlen, StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisError, Script};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// BF.ADD first: if it fails the script aborts before XACK and the entry
/// stays pending. Scripts run atomically, so no reader sees half of the pair.
const ACK_AND_MARK_SCRIPT: &str = r#"
redis.call('BF.ADD', KEYS[2], ARGV[3])
return redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
"#;

/// Redis store client
///
/// Short commands share one multiplexed connection. A blocked XREADGROUP
/// stalls every command queued behind it on the same socket, so each
/// consumer reads over a connection of its own.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    readers: Arc<Mutex<HashMap<String, MultiplexedConnection>>>,
    ack_and_mark: Script,
}

/// Map the "already exists" family of init errors to a recoverable error
fn init_error(e: RedisError, name: &str) -> PipelineError {
    let detail = e.to_string();
    if e.code() == Some("BUSYGROUP")
        || detail.contains("already exists")
        || detail.contains("item exists")
    {
        PipelineError::AlreadyExists(name.to_string())
    } else {
        PipelineError::Store(e)
    }
}

/// RedisBloom reports an absent sketch as "CMS: key does not exist"
fn is_missing_key(e: &RedisError) -> bool {
    e.to_string().contains("does not exist")
}

impl RedisStore {
    /// Connect to Redis and build the shared connection manager
    pub async fn connect(redis_url: &str) -> PipelineResult<Self> {
        info!("Connecting to Redis at {}", redis_url);

        let client = Client::open(redis_url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            PipelineError::Config(format!("Invalid Redis URL: {}", e))
        })?;

        let connection = ConnectionManager::new(client.clone()).await.map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            PipelineError::Store(e)
        })?;

        info!("✓ Redis connection established");

        Ok(Self {
            client,
            connection,
            readers: Arc::new(Mutex::new(HashMap::new())),
            ack_and_mark: Script::new(ACK_AND_MARK_SCRIPT),
        })
    }

    /// The consumer's dedicated read connection, opened on first use
    async fn reader(&self, consumer: &str) -> PipelineResult<MultiplexedConnection> {
        let mut readers = self.readers.lock().await;
        if let Some(conn) = readers.get(consumer) {
            return Ok(conn.clone());
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!("Opened read connection for consumer {}", consumer);
        readers.insert(consumer.to_string(), conn.clone());
        Ok(conn)
    }

    /// Forget a read connection after an error so the next read reconnects
    async fn drop_reader(&self, consumer: &str) {
        self.readers.lock().await.remove(consumer);
    }

    /// Number of consumers holding a dedicated read connection
    pub async fn reader_count(&self) -> usize {
        self.readers.lock().await.len()
    }

    fn convert_reply(reply: StreamReadReply) -> PipelineResult<Vec<StreamEntry>> {
        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let mut fields = HashMap::with_capacity(id.map.len());
                for (name, value) in &id.map {
                    let value: String = redis::from_redis_value(value).map_err(|e| {
                        PipelineError::Decode(format!("field {} of {}: {}", name, id.id, e))
                    })?;
                    fields.insert(name.clone(), value);
                }
                entries.push(StreamEntry::new(id.id, fields));
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl StreamStore for RedisStore {
    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> PipelineResult<()> {
        let mut conn = self.connection.clone();
        let result: Result<(), RedisError> =
            conn.xgroup_create_mkstream(stream, group, start_id).await;
        result.map_err(|e| init_error(e, &format!("{}/{}", stream, group)))
    }

    async fn read_group(&self, request: &ReadRequest<'_>) -> PipelineResult<Vec<StreamEntry>> {
        let mut opts = StreamReadOptions::default()
            .group(request.group, request.consumer)
            .count(request.count);
        // BLOCK 0 would wait forever; a zero duration means "don't block"
        if request.cursor == ReadCursor::New && !request.block.is_zero() {
            opts = opts.block(request.block.as_millis() as usize);
        }

        let mut conn = self.reader(request.consumer).await?;
        let result: Result<Option<StreamReadReply>, RedisError> = conn
            .xread_options(&[request.stream], &[request.cursor.as_id()], &opts)
            .await;
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    "XREADGROUP failed for {}/{} ({}): {}",
                    request.stream, request.group, request.consumer, e
                );
                if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                    self.drop_reader(request.consumer).await;
                }
                return Err(PipelineError::Store(e));
            }
        };

        match reply {
            Some(reply) => Self::convert_reply(reply),
            None => Ok(Vec::new()),
        }
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> PipelineResult<u64> {
        let mut conn = self.connection.clone();
        let acked: u64 = conn.xack(stream, group, &[entry_id]).await?;
        Ok(acked)
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: Option<usize>,
    ) -> PipelineResult<String> {
        let mut conn = self.connection.clone();
        let id: String = match max_len {
            Some(max_len) => {
                conn.xadd_maxlen(stream, StreamMaxlen::Equals(max_len), "*", fields)
                    .await?
            }
            None => conn.xadd(stream, "*", fields).await?,
        };
        Ok(id)
    }

    async fn ack_and_mark(&self, target: &AckAndMark<'_>) -> PipelineResult<()> {
        let mut conn = self.connection.clone();
        let _acked: u64 = self
            .ack_and_mark
            .key(target.stream)
            .key(target.filter)
            .arg(target.group)
            .arg(target.entry_id)
            .arg(target.key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(
                    "ack+mark failed for {} in {}/{}: {}",
                    target.entry_id, target.stream, target.group, e
                );
                PipelineError::Store(e)
            })?;
        Ok(())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> PipelineResult<u64> {
        let mut conn = self.connection.clone();
        let reply: StreamPendingReply = conn.xpending(stream, group).await?;
        Ok(reply.count() as u64)
    }

    async fn stream_len(&self, stream: &str) -> PipelineResult<u64> {
        let mut conn = self.connection.clone();
        let len: u64 = conn.xlen(stream).await?;
        Ok(len)
    }

    async fn ping(&self) -> PipelineResult<()> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;

        if pong != "PONG" {
            return Err(PipelineError::Internal(
                "Unexpected Redis PING response".to_string(),
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl FilterStore for RedisStore {
    async fn reserve(
        &self,
        name: &str,
        error_rate: f64,
        capacity: u64,
        expansion: u32,
    ) -> PipelineResult<()> {
        let mut conn = self.connection.clone();
        let result: Result<(), RedisError> = redis::cmd("BF.RESERVE")
            .arg(name)
            .arg(error_rate)
            .arg(capacity)
            .arg("EXPANSION")
            .arg(expansion)
            .query_async(&mut conn)
            .await;
        result.map_err(|e| init_error(e, name))
    }

    async fn exists(&self, name: &str, key: &str) -> PipelineResult<bool> {
        let mut conn = self.connection.clone();
        let present: bool = redis::cmd("BF.EXISTS")
            .arg(name)
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(present)
    }

    async fn add(&self, name: &str, key: &str) -> PipelineResult<bool> {
        let mut conn = self.connection.clone();
        let added: bool = redis::cmd("BF.ADD")
            .arg(name)
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(added)
    }
}

#[async_trait]
impl SketchStore for RedisStore {
    async fn init_by_dim(&self, name: &str, width: u32, depth: u32) -> PipelineResult<()> {
        let mut conn = self.connection.clone();
        let result: Result<(), RedisError> = redis::cmd("CMS.INITBYDIM")
            .arg(name)
            .arg(width)
            .arg(depth)
            .query_async(&mut conn)
            .await;
        result.map_err(|e| init_error(e, name))
    }

    async fn incr_by(&self, name: &str, items: &[(String, u64)]) -> PipelineResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("CMS.INCRBY");
        cmd.arg(name);
        for (item, by) in items {
            cmd.arg(item).arg(*by);
        }
        let mut conn = self.connection.clone();
        let _counts: Vec<u64> = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn query(&self, name: &str, items: &[String]) -> PipelineResult<Vec<u64>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let result: Result<Vec<u64>, RedisError> = redis::cmd("CMS.QUERY")
            .arg(name)
            .arg(items)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(counts) => Ok(counts),
            Err(e) if is_missing_key(&e) => Ok(vec![0; items.len()]),
            Err(e) => Err(PipelineError::Store(e)),
        }
    }

    async fn add_names(&self, set: &str, names: &[String]) -> PipelineResult<()> {
        if names.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _added: u64 = conn.sadd(set, names).await?;
        Ok(())
    }

    async fn names(&self, set: &str) -> PipelineResult<Vec<String>> {
        let mut conn = self.connection.clone();
        let names: Vec<String> = conn.smembers(set).await?;
        Ok(names)
    }
}

#[async_trait]
impl IndexStore for RedisStore {
    async fn upsert(&self, key: &str, fields: &[(&str, String)]) -> PipelineResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn fetch(&self, key: &str) -> PipelineResult<Option<HashMap<String, String>>> {
        let mut conn = self.connection.clone();
        let record: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(if record.is_empty() { None } else { Some(record) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_errors_are_classified() {
        let busy = RedisError::from((
            redis::ErrorKind::ExtensionError,
            "BUSYGROUP",
            "Consumer Group name already exists".to_string(),
        ));
        assert!(init_error(busy, "s/g").is_already_exists());

        let other = RedisError::from((redis::ErrorKind::IoError, "connection reset"));
        assert!(!init_error(other, "s/g").is_already_exists());
    }

    #[test]
    fn test_missing_sketch_is_recognized() {
        let missing = RedisError::from((
            redis::ErrorKind::ResponseError,
            "An error was signalled by the server",
            "CMS: key does not exist".to_string(),
        ));
        assert!(is_missing_key(&missing));

        let other = RedisError::from((redis::ErrorKind::IoError, "connection reset"));
        assert!(!is_missing_key(&other));
    }

    /// Needs a Redis server: `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_blocked_reads_do_not_stall_other_commands() {
        use std::time::{Duration, Instant};

        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let store = RedisStore::connect(&url).await.unwrap();
        let stream = format!("skystream:test:{}", std::process::id());
        let _ = store.create_group(&stream, "g", "$").await;

        let mut readers = Vec::new();
        for consumer in ["c1", "c2"] {
            let store = store.clone();
            let stream = stream.clone();
            readers.push(tokio::spawn(async move {
                let request = ReadRequest {
                    stream: &stream,
                    group: "g",
                    consumer,
                    count: 1,
                    block: Duration::from_millis(1500),
                    cursor: ReadCursor::New,
                };
                store.read_group(&request).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        store.stream_len(&stream).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(store.reader_count().await, 2);

        store.append(&stream, &[("uri", "at://x/1".to_string())], None).await.unwrap();
        store.append(&stream, &[("uri", "at://x/2".to_string())], None).await.unwrap();
        for reader in readers {
            assert_eq!(reader.await.unwrap().unwrap().len(), 1);
        }

        let mut conn = store.connection.clone();
        let _: () = conn.del(&stream).await.unwrap();
    }

    #[test]
    fn test_script_adds_before_ack() {
        let add = ACK_AND_MARK_SCRIPT.find("BF.ADD").unwrap();
        let ack = ACK_AND_MARK_SCRIPT.find("XACK").unwrap();
        assert!(add < ack);
    }
}
