use std::sync::Arc;

use axum::{routing::get, Router};

use crate::AppState;

pub mod auth;
pub mod calendar;
pub mod health;

/// All routes with state applied. Transport layers (tracing, CORS) are added by `main`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api/calendar-sync", calendar::router())
        .with_state(state)
}
