use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{patch, post};
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::tracker::{IngestOutcome, LocationUpdate};
use crate::error::AppError;
use crate::models::driver::{Driver, GeoPoint, VehicleType};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", post(register_driver).get(list_drivers))
        .route("/drivers/:id/status", patch(update_driver_status))
        .route("/drivers/:id/location", post(report_location))
}

#[derive(Deserialize)]
pub struct RegisterDriverRequest {
    pub name: String,
    pub vehicle: VehicleType,
    #[serde(default = "default_rating")]
    pub rating: f64,
}

fn default_rating() -> f64 {
    5.0
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub online: bool,
}

#[derive(Deserialize)]
pub struct LocationReport {
    pub point: GeoPoint,
    pub heading: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub recorded_at: Option<DateTime<Utc>>,
}

async fn register_driver(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterDriverRequest>,
) -> Result<Json<Driver>, AppError> {
    let driver = state
        .drivers
        .register(payload.name, payload.vehicle, payload.rating)?;
    Ok(Json(driver))
}

async fn list_drivers(State(state): State<Arc<AppState>>) -> Json<Vec<Driver>> {
    Json(state.drivers.list())
}

async fn update_driver_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Driver>, AppError> {
    let driver = state.drivers.set_online(id, payload.online)?;
    Ok(Json(driver))
}

async fn report_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<LocationReport>,
) -> Result<Json<IngestOutcome>, AppError> {
    let outcome = state
        .tracker
        .ingest(
            id,
            LocationUpdate {
                point: payload.point,
                heading: payload.heading,
                speed_kmh: payload.speed_kmh,
                recorded_at: payload.recorded_at.unwrap_or_else(Utc::now),
            },
        )
        .await?;
    Ok(Json(outcome))
}
