use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/api/v1/projects/:name",
            post(handlers::upload_project).delete(handlers::remove_project),
        )
        .route(
            "/api/v1/submissions/:project_name",
            post(handlers::execute_submission),
        )
        .route("/api/v1/requests/:id", get(handlers::get_request))
}
