//! Instance endpoints.

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::orchestrator::InstanceTeardown;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/{instance_id}/teardown", post(teardown_instance))
}

/// POST /v1/instances/{instance_id}/teardown
///
/// Deferred while the instance is still provisioning.
async fn teardown_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<String>,
) -> Result<Json<InstanceTeardown>, ApiError> {
    state
        .orchestrator()
        .teardown_instance(&instance_id, ctx.correlation_id())
        .await
        .map(Json)
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))
}
