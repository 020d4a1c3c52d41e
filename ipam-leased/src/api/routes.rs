use std::sync::Arc;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use shared::protocol::{ADDRESSES_PATH, HEALTH_PATH, ZONES_PATH};
use shared::types::{LeaseRequest, LeaseResponse};
use crate::engine::LeaseEngine;
use crate::error::LeaseError;
use crate::prefix_cache::PrefixCache;
use super::validate::validate;

#[derive(Clone)]
pub struct AppState {
    pub engine: LeaseEngine,
    pub cache: Arc<PrefixCache>,
    pub max_retention_days: u32,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: u16,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub zones: usize,
    pub containers: usize,
}

/// Error response carrying the status and message sent to the caller.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<LeaseError> for ApiError {
    fn from(err: LeaseError) -> Self {
        let status = match &err {
            LeaseError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            LeaseError::NotFound | LeaseError::ServiceNotFound(_) => StatusCode::NOT_FOUND,
            LeaseError::SecretChangeRejected(_) | LeaseError::ConcurrentModification => StatusCode::CONFLICT,
            LeaseError::InvalidZoneForAddress { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            LeaseError::NoCapacity { .. } | LeaseError::Allocator(_) | LeaseError::Store(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            LeaseError::Cipher(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            message: self.message,
            code: self.status.as_u16(),
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(ADDRESSES_PATH, post(register).delete(expire))
        .route(ZONES_PATH, get(get_zones))
        .route(HEALTH_PATH, get(get_health))
        .with_state(state)
}

fn parse_body(body: Result<Json<LeaseRequest>, JsonRejection>) -> Result<LeaseRequest, ApiError> {
    body.map(|Json(req)| req).map_err(|e| {
        tracing::debug!("Rejected request body: {}", e);
        ApiError::bad_request(format!("could not parse incoming request: {}", e.body_text()))
    })
}

fn log_failure(action: &str, req: &LeaseRequest, err: &LeaseError) {
    if err.is_client_error() {
        tracing::debug!("{} for {} rejected: {}", action, req.service.key(), err);
    } else {
        tracing::error!("{} for {} failed: {}", action, req.service.key(), err);
    }
}

async fn register(
    State(state): State<AppState>,
    body: Result<Json<LeaseRequest>, JsonRejection>,
) -> Result<Json<LeaseResponse>, ApiError> {
    let req = parse_body(body)?;
    validate(&req, &state.cache, state.max_retention_days)?;

    state.engine.register(&req).await.map(Json).map_err(|e| {
        log_failure("Register", &req, &e);
        e.into()
    })
}

async fn expire(
    State(state): State<AppState>,
    body: Result<Json<LeaseRequest>, JsonRejection>,
) -> Result<Json<LeaseResponse>, ApiError> {
    let req = parse_body(body)?;
    validate(&req, &state.cache, state.max_retention_days)?;
    if req.requested_address().is_none() {
        return Err(ApiError::bad_request("'address' is required"));
    }

    state.engine.set_service_expiration(&req).await.map(Json).map_err(|e| {
        log_failure("Expire", &req, &e);
        e.into()
    })
}

async fn get_zones(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.cache.zones())
}

async fn get_health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = state.cache.snapshot();
    let containers = snapshot.values().map(Vec::len).sum();
    let zones = state.cache.zones().len();

    if containers == 0 {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse { status: "no prefixes cached", zones, containers }),
        );
    }
    (StatusCode::OK, Json(HealthResponse { status: "ok", zones, containers }))
}
