//! Route endpoints.
//!
//! A route publishes `{subdomain}.{domain}` through the tunnel to a port
//! owned by the calling workload.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::error::ApiError;
use crate::api::request_context::Identity;
use crate::app::AppState;
use crate::broker::{RouteRemoval, RouteRequest};
use crate::state::{RouteStatus, RoutingRecord, TargetKind};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_routes).post(create_route))
        .route("/{fqdn}", delete(delete_route))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateRouteRequest {
    pub subdomain: String,
    pub domain: String,
    pub target_port: u16,
    /// Defaults to the caller.
    #[serde(default)]
    pub owning_workload: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PrivilegeQuery {
    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteRouteQuery {
    /// Set when the path carries a bare label instead of a full hostname.
    pub domain: Option<String>,
    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListRoutesQuery {
    pub workload: Option<String>,
    pub domain: Option<String>,
    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Serialize)]
pub struct RouteResponse {
    pub hostname: String,
    pub subdomain: String,
    pub domain: String,
    pub public_url: String,
    pub owning_workload: String,
    pub target_port: u16,
    pub target_kind: TargetKind,
    pub target_address: String,
    /// `kind:address`, e.g. `host:localhost:5000`.
    pub target: String,
    pub status: RouteStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<RoutingRecord> for RouteResponse {
    fn from(record: RoutingRecord) -> Self {
        Self {
            hostname: record.fqdn(),
            public_url: record.public_url(),
            target: record.target(),
            subdomain: record.hostname,
            domain: record.domain,
            owning_workload: record.owning_workload,
            target_port: record.target_port,
            target_kind: record.target_kind,
            target_address: record.target_address,
            status: record.status,
            created_at: record.created_at,
            deleted_at: record.deleted_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteRouteResponse {
    #[serde(flatten)]
    pub route: RouteResponse,
    /// Cleanup the control plane could not do itself.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl From<RouteRemoval> for DeleteRouteResponse {
    fn from(removal: RouteRemoval) -> Self {
        Self {
            route: RouteResponse::from(removal.record),
            warnings: removal.warnings,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListRoutesResponse {
    pub items: Vec<RouteResponse>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_route(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<PrivilegeQuery>,
    body: Result<Json<CreateRouteRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body.map_err(|rejection| {
        ApiError::bad_request("invalid_body", rejection.body_text())
            .with_request_id(&identity.request_id)
    })?;
    let broker = state.broker();
    let caller = broker.caller(&identity.workload, query.privileged);

    let request = RouteRequest {
        hostname: req.subdomain,
        domain: req.domain,
        target_port: req.target_port,
        owning_workload: req
            .owning_workload
            .unwrap_or_else(|| identity.workload.clone()),
    };

    let grant = broker
        .request_route(&caller, &request)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&identity.request_id))?;
    info!(
        request_id = %identity.request_id,
        hostname = %grant.record.fqdn(),
        owner = %grant.record.owning_workload,
        "Route granted"
    );
    Ok((StatusCode::CREATED, Json(RouteResponse::from(grant.record))))
}

async fn delete_route(
    State(state): State<AppState>,
    identity: Identity,
    Path(fqdn): Path<String>,
    Query(query): Query<DeleteRouteQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let broker = state.broker();
    let caller = broker.caller(&identity.workload, query.privileged);

    let removal = broker
        .delete_route(&caller, &fqdn, query.domain.as_deref())
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&identity.request_id))?;
    info!(
        request_id = %identity.request_id,
        hostname = %removal.record.fqdn(),
        warnings = removal.warnings.len(),
        "Route deleted"
    );
    Ok(Json(DeleteRouteResponse::from(removal)))
}

async fn list_routes(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<ListRoutesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let broker = state.broker();
    let caller = broker.caller(&identity.workload, query.privileged);

    let records =
        broker.list_routes(&caller, query.workload.as_deref(), query.domain.as_deref())?;
    Ok(Json(ListRoutesResponse {
        items: records.into_iter().map(RouteResponse::from).collect(),
    }))
}
