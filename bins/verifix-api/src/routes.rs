use crate::handlers;
use crate::AppState;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/verify", post(handlers::verify))
        .route("/execute", post(handlers::execute))
        .route("/results/:id", get(handlers::get_result))
        .route("/status", get(handlers::health_check))
        .route("/languages", get(handlers::list_languages))
}
