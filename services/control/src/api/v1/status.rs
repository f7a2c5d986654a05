//! Tunnel status.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};

use crate::api::error::ApiError;
use crate::api::request_context::Identity;
use crate::app::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(get_status))
}

async fn get_status(
    State(state): State<AppState>,
    _identity: Identity,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.broker().status()?))
}
