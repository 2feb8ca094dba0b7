/// Health check endpoints for liveness and readiness probes
///
/// Readiness pings the store and reports the backlog of both pipelines.

use crate::{context::AppContext, error::PipelineResult, metrics};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// "ready" or "unavailable"
    pub status: String,
    pub version: String,
    pub uptime_seconds: f64,
    pub checks: Vec<ComponentHealth>,
}

/// Health of one dependency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Build health check routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health_basic))
        .route("/health/ready", get(readiness_probe))
        .route("/metrics", get(metrics_text))
}

/// Basic liveness check
pub async fn health_basic() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness probe: 200 when the store answers, 503 otherwise
pub async fn readiness_probe(State(ctx): State<AppContext>) -> (StatusCode, Json<HealthStatus>) {
    let store = check_store(&ctx).await;
    let ready = store.status == "healthy";

    if !ready {
        tracing::warn!(error = ?store.error, "readiness_probe_failed: store check failed");
    }

    let health = HealthStatus {
        status: if ready { "ready" } else { "unavailable" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: ctx.started_at.elapsed().as_secs_f64(),
        checks: vec![store],
    };
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health))
}

/// Prometheus text exposition
pub async fn metrics_text() -> PipelineResult<impl IntoResponse> {
    let body = metrics::render_metrics()?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

async fn backlog(ctx: &AppContext) -> PipelineResult<serde_json::Value> {
    let streams = &ctx.config.streams;
    Ok(serde_json::json!({
        "raw_length": ctx.log.stream_len(&streams.raw).await?,
        "raw_pending": ctx.log.pending_count(&streams.raw, &streams.ingest_group).await?,
        "filtered_length": ctx.log.stream_len(&streams.filtered).await?,
        "filtered_pending": ctx.log.pending_count(&streams.filtered, &streams.enrich_group).await?,
    }))
}

async fn check_store(ctx: &AppContext) -> ComponentHealth {
    let start = Instant::now();
    let result = match ctx.log.ping().await {
        Ok(()) => backlog(ctx).await,
        Err(e) => Err(e),
    };
    let elapsed = Some(start.elapsed().as_millis() as u64);

    match result {
        Ok(details) => ComponentHealth {
            name: "store".to_string(),
            status: "healthy".to_string(),
            response_time_ms: elapsed,
            error: None,
            details: Some(details),
        },
        Err(e) => ComponentHealth {
            name: "store".to_string(),
            status: "unhealthy".to_string(),
            response_time_ms: elapsed,
            error: Some(e.to_string()),
            details: None,
        },
    }
}
