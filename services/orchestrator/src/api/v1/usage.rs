//! Cached provider usage.
//!
//! Reads never reach the provider. A missing entry means usage is unknown and
//! is reported as 404, not as zero.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;
use crate::usage::UsageCacheEntry;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_projects))
        .route("/{project_id}", get(get_usage).delete(invalidate_usage))
}

#[derive(Debug, Serialize)]
struct CachedProjectsResponse {
    ttl_seconds: u64,
    projects: Vec<String>,
}

/// GET /v1/usage
async fn list_projects(State(state): State<AppState>) -> Json<CachedProjectsResponse> {
    let orchestrator = state.orchestrator();
    Json(CachedProjectsResponse {
        ttl_seconds: orchestrator.usage_cache().ttl().as_secs(),
        projects: orchestrator.cached_projects().await,
    })
}

/// GET /v1/usage/{project_id}
async fn get_usage(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(project_id): Path<String>,
) -> Result<Json<UsageCacheEntry>, ApiError> {
    state
        .orchestrator()
        .project_usage(&project_id)
        .await
        .map(Json)
        .ok_or_else(|| {
            ApiError::not_found(
                "usage_unknown",
                format!("No fresh usage cached for project {project_id}"),
            )
            .with_request_id(ctx.request_id)
        })
}

/// DELETE /v1/usage/{project_id}
async fn invalidate_usage(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> StatusCode {
    state.orchestrator().usage_cache().invalidate(&project_id).await;
    StatusCode::NO_CONTENT
}
