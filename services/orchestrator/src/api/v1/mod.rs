//! API v1 routes.

mod deployments;
mod instances;
mod usage;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/deployments", deployments::routes())
        .nest("/instances", instances::routes())
        .nest("/usage", usage::routes())
}
