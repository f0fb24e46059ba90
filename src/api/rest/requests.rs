use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::coordinator::ResponseOutcome;
use crate::error::AppError;
use crate::models::booking::{BookingRequest, Decision};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/requests/:id", get(get_request))
        .route("/requests/:id/respond", post(respond))
}

#[derive(Deserialize)]
pub struct RespondRequest {
    pub driver_id: Uuid,
    pub decision: Decision,
}

async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<BookingRequest>, AppError> {
    Ok(Json(state.coordinator.request(id).await?))
}

async fn respond(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RespondRequest>,
) -> Result<Json<ResponseOutcome>, AppError> {
    let outcome = state
        .coordinator
        .driver_respond(id, payload.driver_id, payload.decision)
        .await?;
    Ok(Json(outcome))
}
