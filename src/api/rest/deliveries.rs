use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::delivery::{Actor, Delivery};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deliveries/:id", get(get_delivery))
        .route("/deliveries/:id/pickup", post(pick_up))
        .route("/deliveries/:id/transit", post(start_transit))
        .route("/deliveries/:id/complete", post(complete))
        .route("/deliveries/:id/cancel", post(cancel))
        .route("/deliveries/:id/confirm", post(confirm))
}

#[derive(Deserialize)]
pub struct DriverAction {
    pub driver_id: Uuid,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub actor: Actor,
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct ConfirmRequest {
    pub customer_id: Uuid,
}

async fn get_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Delivery>, AppError> {
    Ok(Json(state.deliveries.get(id).await?))
}

async fn pick_up(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DriverAction>,
) -> Result<Json<Delivery>, AppError> {
    Ok(Json(state.deliveries.pick_up(id, payload.driver_id).await?))
}

async fn start_transit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DriverAction>,
) -> Result<Json<Delivery>, AppError> {
    Ok(Json(
        state.deliveries.start_transit(id, payload.driver_id).await?,
    ))
}

async fn complete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DriverAction>,
) -> Result<Json<Delivery>, AppError> {
    Ok(Json(state.deliveries.complete(id, payload.driver_id).await?))
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<Delivery>, AppError> {
    if payload.actor == Actor::System {
        return Err(AppError::Forbidden(
            "system cancellations are not accepted over http".to_string(),
        ));
    }
    let delivery = state
        .deliveries
        .cancel(id, payload.actor, payload.reason)
        .await?;
    Ok(Json(delivery))
}

async fn confirm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ConfirmRequest>,
) -> Result<Json<Delivery>, AppError> {
    Ok(Json(
        state
            .deliveries
            .confirm_receipt(id, payload.customer_id)
            .await?,
    ))
}
