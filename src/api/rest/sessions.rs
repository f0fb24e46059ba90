use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::coordinator::StartSearch;
use crate::error::AppError;
use crate::models::booking::Place;
use crate::models::driver::{GeoPoint, VehicleType};
use crate::models::session::{Candidate, SearchSession};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/candidates", get(find_candidates))
        .route("/sessions", post(start_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/search", post(refresh_candidates))
        .route("/sessions/:id/select", post(select_driver))
        .route("/sessions/:id/broadcast", post(broadcast))
        .route("/sessions/:id/cancel", post(cancel_session))
}

#[derive(Deserialize)]
pub struct CandidateQuery {
    pub lat: f64,
    pub lng: f64,
    pub radius_km: Option<f64>,
    pub vehicle: Option<VehicleType>,
}

#[derive(Deserialize)]
pub struct StartSessionRequest {
    pub customer_id: Uuid,
    pub pickup: Place,
    pub dropoff: Place,
    pub fare: Decimal,
    pub vehicle: Option<VehicleType>,
}

#[derive(Deserialize)]
pub struct SelectDriverRequest {
    pub driver_id: Uuid,
}

async fn find_candidates(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CandidateQuery>,
) -> Result<Json<Vec<Candidate>>, AppError> {
    let origin = GeoPoint {
        lat: query.lat,
        lng: query.lng,
    };
    if !origin.is_valid() {
        return Err(AppError::Validation("coordinates out of range".to_string()));
    }

    let radius_km = query.radius_km.unwrap_or(state.config.search_radius_km);
    if !radius_km.is_finite() || radius_km <= 0.0 {
        return Err(AppError::Validation("radius_km must be > 0".to_string()));
    }

    let candidates = state
        .proximity
        .find_candidates(origin, radius_km, query.vehicle, Utc::now());
    Ok(Json(candidates))
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<StartSessionRequest>,
) -> Result<Json<SearchSession>, AppError> {
    let session = state
        .coordinator
        .start_search(StartSearch {
            customer_id: payload.customer_id,
            pickup: payload.pickup,
            dropoff: payload.dropoff,
            fare: payload.fare,
            vehicle: payload.vehicle,
        })
        .await?;
    Ok(Json(session))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SearchSession>, AppError> {
    Ok(Json(state.coordinator.get_session(id).await?))
}

async fn refresh_candidates(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SearchSession>, AppError> {
    Ok(Json(state.coordinator.refresh_candidates(id).await?))
}

async fn select_driver(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SelectDriverRequest>,
) -> Result<Json<SearchSession>, AppError> {
    let session = state
        .coordinator
        .select_driver(id, payload.driver_id)
        .await?;
    Ok(Json(session))
}

async fn broadcast(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SearchSession>, AppError> {
    Ok(Json(state.coordinator.broadcast_all(id).await?))
}

async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SearchSession>, AppError> {
    Ok(Json(state.coordinator.cancel_session(id).await?))
}
