/// Route matching over an external similarity search service
use crate::{
    error::{PipelineError, PipelineResult},
    handlers::{check_status, http_client},
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Route answered locally from the topic tracker
pub const TRENDING_TOPICS_ROUTE: &str = "trending_topics";

/// Closest route for a query and its similarity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteMatch {
    pub route: String,
    pub score: f64,
}

/// Picks the route that best matches a free-text query
///
/// `None` means nothing matched closely enough.
#[async_trait]
pub trait RouteMatcher: Send + Sync {
    async fn best_route(&self, text: &str) -> PipelineResult<Option<RouteMatch>>;
}

#[derive(Serialize)]
struct RouteRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct RouteResponse {
    route: Option<String>,
    #[serde(default)]
    score: f64,
}

/// Client for the route search endpoint
pub struct HttpRouteMatcher {
    http_client: Client,
    endpoint: String,
    min_score: f64,
}

impl HttpRouteMatcher {
    pub fn new(endpoint: impl Into<String>, min_score: f64, timeout: Duration) -> PipelineResult<Self> {
        Ok(Self {
            http_client: http_client(timeout)?,
            endpoint: endpoint.into(),
            min_score,
        })
    }
}

/// Drop replies without a route or below the minimum score
fn accept(route: Option<String>, score: f64, min_score: f64) -> Option<RouteMatch> {
    match route {
        Some(route) if !route.is_empty() && score >= min_score => Some(RouteMatch { route, score }),
        _ => None,
    }
}

#[async_trait]
impl RouteMatcher for HttpRouteMatcher {
    async fn best_route(&self, text: &str) -> PipelineResult<Option<RouteMatch>> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&RouteRequest { text })
            .send()
            .await
            .map_err(|e| PipelineError::External(format!("Route search failed: {}", e)))?;
        let reply: RouteResponse = check_status("route search", response).await?.json().await?;

        debug!("Route search returned {:?} at {:.3}", reply.route, reply.score);
        Ok(accept(reply.route, reply.score, self.min_score))
    }
}
