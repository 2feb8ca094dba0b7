/// HTTP server setup and routing
use crate::{
    context::AppContext,
    error::{PipelineError, PipelineResult},
};
use axum::{http::StatusCode, response::Json, Router};
use serde_json::json;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the main application router
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .merge(crate::api::routes())
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .fallback(not_found)
}

/// 404 handler
async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "NotFound",
            "message": "Endpoint not found"
        })),
    )
}

/// Start the HTTP server and run until shutdown is signalled
pub async fn serve(ctx: AppContext, mut shutdown: watch::Receiver<bool>) -> PipelineResult<()> {
    let addr = format!("{}:{}", ctx.config.api.host, ctx.config.api.port);

    let app = build_router(ctx);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| PipelineError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    info!("✓ Query API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // a dropped sender also means shut down
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::routing::{RouteMatch, RouteMatcher};
    use crate::store::MemoryStore;
    use crate::topics::TimeBucket;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Fixed(Option<&'static str>);

    #[async_trait]
    impl RouteMatcher for Fixed {
        async fn best_route(&self, _text: &str) -> PipelineResult<Option<RouteMatch>> {
            Ok(self.0.map(|route| RouteMatch {
                route: route.to_string(),
                score: 0.9,
            }))
        }
    }

    fn context() -> AppContext {
        let config = PipelineConfig::from_map(&HashMap::new()).unwrap();
        AppContext::with_store(config, Arc::new(MemoryStore::new()))
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let ctx = context();
        ctx.prepare().await.unwrap();

        let (status, body) = call(build_router(ctx.clone()), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(build_router(ctx), get("/health/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["checks"][0]["details"]["raw_pending"], 0);
    }

    #[tokio::test]
    async fn test_trending_topics() {
        let ctx = context();
        let bucket = TimeBucket::parse("2024-09-09T19").unwrap();
        let topics: Vec<String> = ["rust", "rust", "tokio"].iter().map(|t| t.to_string()).collect();
        ctx.tracker.record(&topics, bucket).await.unwrap();

        let (status, body) = call(
            build_router(ctx.clone()),
            get("/topics/trending?bucket=2024-09-09T19&k=1"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["bucket"], "2024-09-09T19");
        assert_eq!(body["topics"][0]["topic"], "rust");
        assert_eq!(body["topics"][0]["count"], 2);
        assert_eq!(body["topics"].as_array().unwrap().len(), 1);

        let (status, body) = call(build_router(ctx.clone()), get("/topics")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["topics"], json!(["rust", "tokio"]));

        let (status, body) = call(build_router(ctx), get("/topics/trending?bucket=noon")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidRequest");
    }

    #[tokio::test]
    async fn test_query_routes() {
        let ctx = context().with_router(Arc::new(Fixed(Some("trending_topics"))));
        ctx.tracker
            .record(&["bluesky".to_string()], TimeBucket::current())
            .await
            .unwrap();
        let (status, body) = call(build_router(ctx), post_json("/query", json!({"text": "what's hot?"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["route"], "trending_topics");
        assert_eq!(body["topics"][0]["topic"], "bluesky");

        let ctx = context().with_router(Arc::new(Fixed(None)));
        let (status, body) = call(build_router(ctx), post_json("/query", json!({"text": "hi"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["route"].is_null());

        let (status, _) = call(build_router(context()), post_json("/query", json!({"text": "hi"}))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_metrics_and_fallback() {
        crate::metrics::record_firehose_message("appended");
        let response = build_router(context()).oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("firehose_messages_total"));

        let (status, body) = call(build_router(context()), get("/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NotFound");
    }
}
