use axum::{
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    middleware::{make_request_span, request_context_middleware},
    services::{rate_limiter::RateLimiter, session_service::SessionService},
};

pub mod sessions;

/// Shared application state. Every field is a handle over external stores;
/// no conversation state lives here.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionService,
    pub rate_limiter: RateLimiter,
}

/// Creates the application router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_routes())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(request_context_middleware))
                .layer(TraceLayer::new_for_http().make_span_with(make_request_span))
                .layer(CorsLayer::permissive()),
        )
}

/// API routes under /api/v1
fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", post(sessions::start_session))
        .route("/sessions/:session_id", get(sessions::get_session))
        .route("/sessions/:session_id/answers", post(sessions::submit_answer))
        .route("/sessions/:session_id/feedback", post(sessions::submit_feedback))
}

/// Health check endpoint
async fn health_check() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}
