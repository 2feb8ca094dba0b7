/// skystream - Bluesky firehose pipeline
///
/// Runs the Jetstream producer, the ingest and enrich runner pools and the
/// query API until Ctrl-C, or until the pools stop on their own when a limit
/// or idle timeout is configured.

use skystream::{
    config::{LoggingConfig, PipelineConfig},
    context::AppContext,
    error::PipelineResult,
    firehose::FirehoseProducer,
    pipeline::{RunnerPool, RunnerStats},
    server,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> PipelineResult<()> {
    // Load configuration (also reads .env)
    let config = PipelineConfig::from_env()?;

    init_tracing(&config.logging);

    print_banner();

    // Create application context
    let ctx = AppContext::new(config).await?;
    ctx.prepare().await?;

    let ingest = Arc::new(ctx.ingest_chain()?);
    let enrich = Arc::new(ctx.enrich_chain()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = &ctx.config.runner;
    let options = ctx.runner_options();

    let ingest_pool = RunnerPool::spawn(
        ctx.log.clone(),
        ingest,
        &runner.consumer_prefix,
        runner.ingest_workers,
        options.clone(),
        shutdown_rx.clone(),
    )?;
    let enrich_pool = RunnerPool::spawn(
        ctx.log.clone(),
        enrich,
        &runner.consumer_prefix,
        runner.enrich_workers,
        options,
        shutdown_rx.clone(),
    )?;

    // Start the firehose producer
    let producer = if ctx.config.firehose.enabled {
        let mut producer = FirehoseProducer::new(
            ctx.log.clone(),
            ctx.config.firehose.clone(),
            ctx.config.streams.raw.clone(),
            ctx.config.streams.raw_max_len,
            shutdown_rx.clone(),
        );
        Some(tokio::spawn(async move { producer.run().await }))
    } else {
        info!("Firehose producer disabled");
        None
    };

    // Start the query API
    let api = if ctx.config.api.enabled {
        Some(tokio::spawn(server::serve(ctx.clone(), shutdown_rx.clone())))
    } else {
        None
    };

    let pools = async { (ingest_pool.join().await, enrich_pool.join().await) };
    tokio::pin!(pools);

    let finished: Option<(RunnerStats, RunnerStats)> = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown signal received");
            None
        }
        stats = &mut pools => {
            info!("Runner pools finished");
            Some(stats)
        }
    };

    let _ = shutdown_tx.send(true);

    let (ingest_stats, enrich_stats) = match finished {
        Some(stats) => stats,
        None => pools.await,
    };

    if let Some(producer) = producer {
        match producer.await {
            Ok(appended) => info!("Producer appended {} events", appended),
            Err(e) => error!("Producer task failed: {}", e),
        }
    }
    if let Some(api) = api {
        match api.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Query API failed: {}", e),
            Err(e) => error!("Query API task failed: {}", e),
        }
    }

    info!(
        "✓ Shutdown complete: ingest {}/{} kept, enrich {}/{} kept",
        ingest_stats.kept, ingest_stats.processed, enrich_stats.kept, enrich_stats.processed
    );

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.filter).unwrap_or_else(|_| EnvFilter::new("skystream=info"));
    let json = logging.json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .init();
}

fn print_banner() {
    println!(
        r#"
       __                 __
  ___ / /____ _____ ___  / /________ ___ ___ _
 (_-</  '_/ // (_-</ _ \/ __/ __/ -_) _ `/  ' \
/___/_/\_\\_, /___/\__/\__/_/  \__/\_,_/_/_/_/
         /___/
        Bluesky firehose pipeline v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
