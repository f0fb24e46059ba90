use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::booking::Place;
use crate::models::driver::VehicleType;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub driver_id: Uuid,
    pub name: String,
    pub vehicle: VehicleType,
    pub rating: f64,
    pub distance_km: f64,
    pub eta_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Searching,
    Waiting {
        request_id: Uuid,
    },
    Accepted {
        request_id: Uuid,
        driver_id: Uuid,
        delivery_id: Uuid,
    },
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Searching => "searching",
            SessionState::Waiting { .. } => "waiting",
            SessionState::Accepted { .. } => "accepted",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Accepted { .. } | SessionState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SearchFailure {
    DriverDeclined,
    NoDriversResponded,
    NoDriversAvailable,
    TransportFailure,
}

impl SearchFailure {
    pub fn message(&self) -> &'static str {
        match self {
            SearchFailure::DriverDeclined => "driver declined",
            SearchFailure::NoDriversResponded => "no drivers responded",
            SearchFailure::NoDriversAvailable => "no drivers available",
            SearchFailure::TransportFailure => "temporarily unable to reach dispatch, please retry",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSession {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub pickup: Place,
    pub dropoff: Place,
    pub fare: Decimal,
    pub distance_km: f64,
    pub vehicle_filter: Option<VehicleType>,
    pub radius_km: f64,
    pub candidates: Vec<Candidate>,
    #[serde(flatten)]
    pub state: SessionState,
    pub last_failure: Option<SearchFailure>,
    pub requests: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
