/// Free-text queries dispatched through the route matcher
use crate::{
    api::topics::bucket_or_current,
    context::AppContext,
    error::{PipelineError, PipelineResult},
    routing::TRENDING_TOPICS_ROUTE,
    topics::TopicCount,
};
use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

const TRENDING_K: usize = 10;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub text: String,
}

#[derive(Debug, Default, Serialize)]
pub struct QueryResponse {
    /// None when no route scored above the minimum
    pub route: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<TopicCount>>,
}

pub fn routes() -> Router<AppContext> {
    Router::new().route("/query", post(query))
}

async fn query(
    State(ctx): State<AppContext>,
    Json(request): Json<QueryRequest>,
) -> PipelineResult<Json<QueryResponse>> {
    if request.text.trim().is_empty() {
        return Err(PipelineError::Decode("text cannot be empty".to_string()));
    }
    let router = ctx
        .router
        .as_ref()
        .ok_or_else(|| PipelineError::External("no route matcher configured".to_string()))?;

    let Some(matched) = router.best_route(&request.text).await? else {
        info!("No route for query");
        return Ok(Json(QueryResponse::default()));
    };
    info!("Query routed to {} ({:.3})", matched.route, matched.score);

    let mut response = QueryResponse {
        route: Some(matched.route.clone()),
        score: Some(matched.score),
        ..QueryResponse::default()
    };

    if matched.route == TRENDING_TOPICS_ROUTE {
        let bucket = bucket_or_current(None)?;
        response.topics = Some(ctx.tracker.top_k_with_counts(bucket, TRENDING_K).await?);
        response.bucket = Some(bucket.label());
    }

    Ok(Json(response))
}
