use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::GeoPoint;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Place {
    pub address: String,
    pub point: GeoPoint,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Direct,
    Broadcast,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Direct => "direct",
            DispatchMode::Broadcast => "broadcast",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl BookingStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, BookingStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Accepted => "accepted",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Pending,
    Accepted,
    Rejected,
    Withdrawn,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub driver_id: Uuid,
    pub state: TargetState,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookingRequest {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub pickup: Place,
    pub dropoff: Place,
    pub fare: Decimal,
    pub distance_km: f64,
    pub mode: DispatchMode,
    pub targets: Vec<Target>,
    pub status: BookingStatus,
    pub winning_driver_id: Option<Uuid>,
    pub ttl_secs: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl BookingRequest {
    pub fn target(&self, driver_id: Uuid) -> Option<&Target> {
        self.targets.iter().find(|t| t.driver_id == driver_id)
    }

    pub fn target_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.targets.iter().map(|t| t.driver_id)
    }

    pub fn drivers_in(&self, state: TargetState) -> Vec<Uuid> {
        self.targets
            .iter()
            .filter(|t| t.state == state)
            .map(|t| t.driver_id)
            .collect()
    }

    pub(crate) fn withdraw_pending(&mut self) {
        for target in self.targets.iter_mut() {
            if target.state == TargetState::Pending {
                target.state = TargetState::Withdrawn;
            }
        }
    }
}
