//! HTTP route handlers for Gatehouse.

use axum::{
    Router,
    http::StatusCode,
    routing::{get, post},
};
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod contact;
mod health;

/// Upper bound for one request; delivery has its own, shorter timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))

        // Contact form
        .route("/contact", post(contact::submit))
        .route("/contact/challenge", get(contact::get_challenge))
        .route("/contact/status", get(contact::get_status))

        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            REQUEST_TIMEOUT,
        ))
        .layer(TraceLayer::new_for_http())

        // Add shared state
        .with_state(state)
}
