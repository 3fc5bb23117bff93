//! Deployment endpoints.
//!
//! Creating a deployment returns as soon as its instances are persisted and
//! handed to the job queue; provisioning progress is observed by polling.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use labfleet_events::AuditEvent;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::domain::DeploymentView;
use crate::orchestrator::{DeploymentList, ListDeploymentsQuery, TeardownReport};
use crate::resolver::CreateDeploymentRequest;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_deployment).get(list_deployments))
        .route("/{deployment_id}", get(get_deployment))
        .route("/{deployment_id}/teardown", post(teardown_deployment))
        .route("/{deployment_id}/events", get(list_events))
}

#[derive(Debug, Serialize)]
struct ListEventsResponse {
    items: Vec<AuditEvent>,
}

/// POST /v1/deployments
async fn create_deployment(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateDeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state
        .orchestrator()
        .create_deployment(req, ctx.correlation_id())
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    tracing::info!(
        deployment_id = %summary.id,
        request_id = %ctx.request_id,
        instances = summary.instance_count,
        "Deployment accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(summary)))
}

/// GET /v1/deployments
async fn list_deployments(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<ListDeploymentsQuery>,
) -> Result<Json<DeploymentList>, ApiError> {
    state
        .orchestrator()
        .list_deployments(&query)
        .await
        .map(Json)
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))
}

/// GET /v1/deployments/{deployment_id}
async fn get_deployment(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(deployment_id): Path<String>,
) -> Result<Json<DeploymentView>, ApiError> {
    state
        .orchestrator()
        .get_deployment(&deployment_id)
        .await
        .map(Json)
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))
}

/// POST /v1/deployments/{deployment_id}/teardown
async fn teardown_deployment(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(deployment_id): Path<String>,
) -> Result<Json<TeardownReport>, ApiError> {
    state
        .orchestrator()
        .teardown_deployment(&deployment_id, ctx.correlation_id())
        .await
        .map(Json)
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))
}

/// GET /v1/deployments/{deployment_id}/events
async fn list_events(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(deployment_id): Path<String>,
) -> Result<Json<ListEventsResponse>, ApiError> {
    state
        .orchestrator()
        .deployment_events(&deployment_id)
        .await
        .map(|items| Json(ListEventsResponse { items }))
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))
}
