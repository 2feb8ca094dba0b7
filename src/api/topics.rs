/// Trending topic queries
use crate::{
    context::AppContext,
    error::{PipelineError, PipelineResult},
    topics::{TimeBucket, TopicCount},
};
use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

const DEFAULT_K: usize = 10;
const MAX_K: usize = 100;

#[derive(Debug, Deserialize)]
pub struct TrendingParams {
    /// `YYYY-MM-DDTHH`; defaults to the current hour
    pub bucket: Option<String>,
    pub k: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct TrendingResponse {
    pub bucket: String,
    pub topics: Vec<TopicCount>,
}

#[derive(Debug, Serialize)]
pub struct KnownTopicsResponse {
    pub topics: Vec<String>,
}

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/topics", get(known))
        .route("/topics/trending", get(trending))
}

/// Resolve the optional bucket label
pub(crate) fn bucket_or_current(label: Option<&str>) -> PipelineResult<TimeBucket> {
    match label {
        Some(label) => TimeBucket::parse(label),
        None => Ok(TimeBucket::current()),
    }
}

async fn trending(
    State(ctx): State<AppContext>,
    Query(params): Query<TrendingParams>,
) -> PipelineResult<Json<TrendingResponse>> {
    let bucket = bucket_or_current(params.bucket.as_deref())?;
    let k = params.k.unwrap_or(DEFAULT_K);
    if k == 0 || k > MAX_K {
        return Err(PipelineError::Decode(format!("k must be between 1 and {}", MAX_K)));
    }

    let topics = ctx.tracker.top_k_with_counts(bucket, k).await?;
    Ok(Json(TrendingResponse {
        bucket: bucket.label(),
        topics,
    }))
}

/// Every topic name recorded so far
async fn known(State(ctx): State<AppContext>) -> PipelineResult<Json<KnownTopicsResponse>> {
    let mut topics = ctx.tracker.known_topics().await?;
    topics.sort();
    Ok(Json(KnownTopicsResponse { topics }))
}
