/// Fixed pool of consumer runners for one pipeline
use crate::{
    error::{PipelineError, PipelineResult},
    pipeline::{ConsumerRunner, HandlerChain, RunnerOptions, RunnerStats},
    store::StreamStore,
};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Runner tasks started together and joined together
pub struct RunnerPool {
    pipeline: String,
    consumers: Vec<String>,
    handles: Vec<JoinHandle<RunnerStats>>,
}

impl RunnerPool {
    /// Consumer name for runner `index` of a pipeline
    pub fn consumer_name(prefix: &str, pipeline: &str, index: usize) -> String {
        format!("{}-{}-{}", prefix, pipeline, index)
    }

    /// Start `workers` runners, each with its own consumer name
    pub fn spawn(
        store: Arc<dyn StreamStore>,
        chain: Arc<HandlerChain>,
        prefix: &str,
        workers: usize,
        options: RunnerOptions,
        shutdown: watch::Receiver<bool>,
    ) -> PipelineResult<Self> {
        let pipeline = chain.pipeline().to_string();
        if workers == 0 {
            return Err(PipelineError::Config(format!(
                "pipeline {} needs at least one worker",
                pipeline
            )));
        }

        let mut consumers = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let consumer = Self::consumer_name(prefix, &pipeline, index);
            let mut runner = ConsumerRunner::new(
                Arc::clone(&store),
                Arc::clone(&chain),
                consumer.clone(),
                options.clone(),
                shutdown.clone(),
            );
            handles.push(tokio::spawn(async move { runner.run().await }));
            consumers.push(consumer);
        }

        info!(
            "✓ Started {} {} runners ({})",
            workers,
            pipeline,
            chain.handler_names().join(" -> ")
        );

        Ok(Self {
            pipeline,
            consumers,
            handles,
        })
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn consumers(&self) -> &[String] {
        &self.consumers
    }

    /// Wait for every runner and sum their counters
    pub async fn join(self) -> RunnerStats {
        let mut total = RunnerStats::default();
        for (consumer, result) in self.consumers.iter().zip(join_all(self.handles).await) {
            match result {
                Ok(stats) => {
                    total.absorb(&stats);
                    if total.stop_reason.is_none() {
                        total.stop_reason = stats.stop_reason;
                    }
                }
                Err(e) => error!("Runner {} terminated abnormally: {}", consumer, e),
            }
        }
        info!(
            "{} pool finished: {} processed, {} kept, {} rejected, {} failed",
            self.pipeline, total.processed, total.kept, total.rejected, total.failed
        );
        total
    }
}
