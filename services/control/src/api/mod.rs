//! HTTP command surface.

pub mod error;
mod health;
pub mod request_context;
mod v1;

use axum::{
    http::{header, Method, Uri},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::api::error::ApiError;
use crate::app::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    Router::new()
        // Health endpoints (no auth required)
        .merge(health::routes())
        .nest("/v1", v1::routes())
        .fallback(unknown_endpoint)
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(cors)
        .with_state(state)
}

async fn unknown_endpoint(uri: Uri) -> ApiError {
    ApiError::not_found("unknown_endpoint", format!("no endpoint at {}", uri.path()))
}
