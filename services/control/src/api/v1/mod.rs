//! API v1 routes.

mod routes;
mod status;
mod zones;

use axum::Router;

use crate::app::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/routes", routes::routes())
        .nest("/zones", zones::routes())
        .nest("/status", status::routes())
}
