//! Caller identity extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::api::error::ApiError;

pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The workload a request speaks for.
///
/// Privilege is not part of the identity: handlers ask the broker, which
/// consults the workload registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub workload: String,
    pub request_id: String,
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn workload_from_authorization(headers: &HeaderMap) -> Result<String, ApiError> {
    let Some(auth_value) = header_string(headers, AUTHORIZATION_HEADER) else {
        return Err(ApiError::unauthorized(
            "missing_authorization",
            "Authorization header is required",
        ));
    };

    let Some(token) = auth_value.trim().strip_prefix("Bearer ") else {
        return Err(ApiError::unauthorized(
            "invalid_authorization",
            "Authorization must be a Bearer token",
        ));
    };

    let Some(workload) = token.trim().strip_prefix("workload:") else {
        return Err(ApiError::unauthorized(
            "invalid_token",
            "token must be in the form 'workload:<name>'",
        ));
    };

    let workload = workload.trim();
    if workload.is_empty()
        || workload.len() > 128
        || !workload
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return Err(ApiError::unauthorized(
            "invalid_token",
            "workload name must be 1-128 letters, digits, '-', '_' or '.'",
        ));
    }

    Ok(workload.to_string())
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let workload = workload_from_authorization(&parts.headers)
            .map_err(|e| e.with_request_id(request_id.clone()))?;
        Ok(Self {
            workload,
            request_id,
        })
    }
}
