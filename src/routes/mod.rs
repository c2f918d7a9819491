pub mod files;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use crate::state::AppState;

async fn healthz() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/files", files::router())
        .route("/healthz", get(healthz))
        .with_state(state)
}
