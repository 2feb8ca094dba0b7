/// Consumer group runner
///
/// One runner owns one consumer name within a group. It drains whatever was
/// left pending for that name by a previous process, then polls for new
/// entries until it hits its limit, goes idle, or is cancelled.
use crate::{
    metrics,
    pipeline::{HandlerChain, Outcome},
    store::{ensure_group, ReadCursor, ReadRequest, StreamStore},
};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Runner tuning
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Max entries per poll
    pub count: usize,
    /// How long a poll for new entries may block
    pub block: Duration,
    /// Stop after this long without entries; None runs as a service
    pub idle_stop: Option<Duration>,
    /// Stop after processing this many entries
    pub limit: Option<u64>,
    /// Where a freshly created group starts reading
    pub start_id: String,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            count: 10,
            block: Duration::from_millis(1000),
            idle_stop: None,
            limit: None,
            start_id: "0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Polling,
    Dispatching,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Limit,
    Idle,
    Cancelled,
}

/// Counters returned when a runner stops
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunnerStats {
    pub processed: u64,
    pub kept: u64,
    pub rejected: u64,
    pub failed: u64,
    pub polls: u64,
    pub empty_polls: u64,
    pub stop_reason: Option<StopReason>,
}

impl RunnerStats {
    /// Fold another runner's counters into this one
    pub fn absorb(&mut self, other: &RunnerStats) {
        self.processed += other.processed;
        self.kept += other.kept;
        self.rejected += other.rejected;
        self.failed += other.failed;
        self.polls += other.polls;
        self.empty_polls += other.empty_polls;
    }
}

/// Exponential delay with jitter for failed polls
struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: BACKOFF_INITIAL,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(BACKOFF_MAX);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }

    fn reset(&mut self) {
        self.current = BACKOFF_INITIAL;
    }
}

pub struct ConsumerRunner {
    store: Arc<dyn StreamStore>,
    chain: Arc<HandlerChain>,
    consumer: String,
    options: RunnerOptions,
    shutdown: watch::Receiver<bool>,
    state: RunnerState,
}

impl ConsumerRunner {
    pub fn new(
        store: Arc<dyn StreamStore>,
        chain: Arc<HandlerChain>,
        consumer: impl Into<String>,
        options: RunnerOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            chain,
            consumer: consumer.into(),
            options,
            shutdown,
            state: RunnerState::Idle,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    fn transition(&mut self, next: RunnerState) {
        if self.state != next {
            debug!(consumer = %self.consumer, "{:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn limit_reached(&self, stats: &RunnerStats) -> bool {
        self.options.limit.is_some_and(|limit| stats.processed >= limit)
    }

    fn batch_size(&self, stats: &RunnerStats) -> usize {
        let count = self.options.count.max(1);
        match self.options.limit {
            Some(limit) => count.min(limit.saturating_sub(stats.processed) as usize),
            None => count,
        }
    }

    /// Never block past the idle deadline
    fn block_for(&self, cursor: ReadCursor, idle_since: Instant) -> Duration {
        if cursor == ReadCursor::Pending {
            return Duration::ZERO;
        }
        match self.options.idle_stop {
            Some(idle) => self.options.block.min(idle.saturating_sub(idle_since.elapsed())),
            None => self.options.block,
        }
    }

    /// Sleep, waking early on shutdown
    async fn pause(&mut self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = self.shutdown.changed() => {
                // sender gone: nobody can cancel us, so still wait out the delay
                if changed.is_err() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Run until limit, idle timeout or cancellation
    pub async fn run(&mut self) -> RunnerStats {
        let target = self.chain.target().clone();
        let pipeline = self.chain.pipeline().to_string();

        info!(
            pipeline = %pipeline,
            consumer = %self.consumer,
            "Runner starting on {}/{}",
            target.stream,
            target.group
        );

        let mut stats = RunnerStats::default();
        let mut backoff = Backoff::new();
        let mut cursor = ReadCursor::Pending;
        let mut group_ready = false;
        let mut idle_since = Instant::now();

        let reason = loop {
            if self.cancelled() {
                break StopReason::Cancelled;
            }
            if self.limit_reached(&stats) {
                break StopReason::Limit;
            }
            if let Some(idle) = self.options.idle_stop {
                if idle_since.elapsed() >= idle {
                    break StopReason::Idle;
                }
            }

            if !group_ready {
                match ensure_group(
                    self.store.as_ref(),
                    &target.stream,
                    &target.group,
                    &self.options.start_id,
                )
                .await
                {
                    Ok(()) => group_ready = true,
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(
                            consumer = %self.consumer,
                            "Failed to ensure group {}/{}, retrying in {:?}: {}",
                            target.stream,
                            target.group,
                            delay,
                            e
                        );
                        self.pause(delay).await;
                        continue;
                    }
                }
            }

            self.transition(RunnerState::Polling);
            let request = ReadRequest {
                stream: &target.stream,
                group: &target.group,
                consumer: &self.consumer,
                count: self.batch_size(&stats),
                block: self.block_for(cursor, idle_since),
                cursor,
            };
            stats.polls += 1;

            let entries = match self.store.read_group(&request).await {
                Ok(entries) => {
                    backoff.reset();
                    entries
                }
                Err(e) => {
                    metrics::POLLS_TOTAL
                        .with_label_values(&[&pipeline, "error"])
                        .inc();
                    let delay = backoff.next_delay();
                    warn!(
                        pipeline = %pipeline,
                        consumer = %self.consumer,
                        "Poll failed, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    // the group may have been dropped along with the stream
                    group_ready = false;
                    self.transition(RunnerState::Idle);
                    self.pause(delay).await;
                    continue;
                }
            };

            if entries.is_empty() {
                if cursor == ReadCursor::Pending {
                    debug!(consumer = %self.consumer, "Pending list drained");
                    cursor = ReadCursor::New;
                } else {
                    stats.empty_polls += 1;
                    metrics::POLLS_TOTAL
                        .with_label_values(&[&pipeline, "empty"])
                        .inc();
                }
                self.transition(RunnerState::Idle);
                continue;
            }

            metrics::POLLS_TOTAL
                .with_label_values(&[&pipeline, "entries"])
                .inc();
            idle_since = Instant::now();
            self.transition(RunnerState::Dispatching);

            let mut batch_failed = false;
            for entry in &entries {
                stats.processed += 1;
                match self.chain.process(entry).await {
                    Ok(Outcome::Kept) => stats.kept += 1,
                    Ok(Outcome::Rejected { .. }) => stats.rejected += 1,
                    Err(_) => {
                        // already logged by the chain; the entry stays pending
                        stats.failed += 1;
                        batch_failed = true;
                    }
                }
            }

            // re-reading our own pending list would hand back the same failures
            if cursor == ReadCursor::Pending && batch_failed {
                cursor = ReadCursor::New;
            }
            self.transition(RunnerState::Idle);
        };

        self.transition(RunnerState::Stopped);
        stats.stop_reason = Some(reason);
        info!(
            pipeline = %pipeline,
            consumer = %self.consumer,
            processed = stats.processed,
            kept = stats.kept,
            rejected = stats.rejected,
            failed = stats.failed,
            "Runner stopped: {:?}",
            reason
        );
        stats
    }
}
