use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::booking::Place;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Accepted,
    PickedUp,
    InTransit,
    Completed,
    Confirmed,
    Cancelled,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Accepted => "accepted",
            DeliveryStatus::PickedUp => "picked_up",
            DeliveryStatus::InTransit => "in_transit",
            DeliveryStatus::Completed => "completed",
            DeliveryStatus::Confirmed => "confirmed",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Accepted | DeliveryStatus::PickedUp | DeliveryStatus::InTransit
        )
    }

    pub fn is_final(&self) -> bool {
        matches!(self, DeliveryStatus::Confirmed | DeliveryStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Customer(Uuid),
    Driver(Uuid),
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmSource {
    Customer,
    AutoConfirm,
}

impl ConfirmSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmSource::Customer => "customer",
            ConfirmSource::AutoConfirm => "auto_confirm",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settlement {
    pub fare: Decimal,
    pub commission_rate: Decimal,
    pub commission: Decimal,
    pub driver_payout: Decimal,
    pub source: ConfirmSource,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delivery {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub driver_id: Uuid,
    pub pickup: Place,
    pub dropoff: Place,
    pub fare: Decimal,
    pub commission_rate: Decimal,
    pub status: DeliveryStatus,
    pub accepted_at: DateTime<Utc>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub in_transit_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<Actor>,
    pub cancel_reason: Option<String>,
    pub settlement: Option<Settlement>,
    pub version: u64,
}

impl Delivery {
    pub fn awaiting_confirmation(&self) -> bool {
        self.completed_at.is_some() && self.confirmed_at.is_none() && self.cancelled_at.is_none()
    }
}
