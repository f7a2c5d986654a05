//! Zone listing.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::request_context::Identity;
use crate::app::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(list_zones))
}

#[derive(Debug, Serialize)]
pub struct ZoneResponse {
    pub domain: String,
    pub provider_zone_id: String,
    pub discovered_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ListZonesResponse {
    pub items: Vec<ZoneResponse>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

async fn list_zones(
    State(state): State<AppState>,
    _identity: Identity,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.broker().list_zones().await?;
    Ok(Json(ListZonesResponse {
        items: snapshot
            .zones
            .into_iter()
            .map(|z| ZoneResponse {
                domain: z.domain_name,
                provider_zone_id: z.provider_zone_id,
                discovered_at: z.discovered_at,
            })
            .collect(),
        refreshed_at: snapshot.refreshed_at,
    }))
}
