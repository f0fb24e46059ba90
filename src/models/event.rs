use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::booking::{DispatchMode, Place};
use crate::models::delivery::{Actor, ConfirmSource, DeliveryStatus};
use crate::models::driver::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Customer(Uuid),
    Driver(Uuid),
    Booking(Uuid),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Customer(id) => write!(f, "customer:{id}"),
            Channel::Driver(id) => write!(f, "driver:{id}"),
            Channel::Booking(id) => write!(f, "booking:{id}"),
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, raw_id) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid channel {s:?}, expected kind:id"))?;
        let id = Uuid::parse_str(raw_id).map_err(|err| format!("invalid channel id: {err}"))?;

        match kind {
            "customer" => Ok(Channel::Customer(id)),
            "driver" => Ok(Channel::Driver(id)),
            "booking" => Ok(Channel::Booking(id)),
            other => Err(format!(
                "unknown channel kind {other:?}, expected customer/driver/booking"
            )),
        }
    }
}

impl Serialize for Channel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EtaTarget {
    Pickup,
    Dropoff,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    Oracle,
    StraightLine,
}

impl RouteSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteSource::Oracle => "oracle",
            RouteSource::StraightLine => "straight_line",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    BookingOffered {
        request_id: Uuid,
        customer_id: Uuid,
        pickup: Place,
        dropoff: Place,
        fare: Decimal,
        distance_km: f64,
        mode: DispatchMode,
        expires_at: DateTime<Utc>,
    },
    SearchWaiting {
        request_id: Uuid,
        mode: DispatchMode,
        targets: usize,
    },
    DriverAssigned {
        request_id: Uuid,
        delivery_id: Uuid,
        driver_id: Uuid,
    },
    NoLongerAvailable {
        request_id: Uuid,
    },
    DriverDeclined {
        request_id: Uuid,
        driver_id: Uuid,
    },
    RequestExpired {
        request_id: Uuid,
    },
    RequestCancelled {
        request_id: Uuid,
    },
    DriverLocation {
        delivery_id: Uuid,
        driver_id: Uuid,
        point: GeoPoint,
        heading: f64,
        speed_kmh: f64,
        recorded_at: DateTime<Utc>,
    },
    EtaUpdated {
        delivery_id: Uuid,
        driver_id: Uuid,
        target: EtaTarget,
        distance_m: f64,
        duration_secs: u64,
        source: RouteSource,
    },
    DeliveryStatusChanged {
        delivery_id: Uuid,
        from: DeliveryStatus,
        to: DeliveryStatus,
        at: DateTime<Utc>,
    },
    DeliveryCancelled {
        delivery_id: Uuid,
        by: Actor,
        reason: Option<String>,
    },
    DeliveryConfirmed {
        delivery_id: Uuid,
        commission: Decimal,
        driver_payout: Decimal,
        source: ConfirmSource,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::BookingOffered { .. } => "booking_offered",
            Event::SearchWaiting { .. } => "search_waiting",
            Event::DriverAssigned { .. } => "driver_assigned",
            Event::NoLongerAvailable { .. } => "no_longer_available",
            Event::DriverDeclined { .. } => "driver_declined",
            Event::RequestExpired { .. } => "request_expired",
            Event::RequestCancelled { .. } => "request_cancelled",
            Event::DriverLocation { .. } => "driver_location",
            Event::EtaUpdated { .. } => "eta_updated",
            Event::DeliveryStatusChanged { .. } => "delivery_status_changed",
            Event::DeliveryCancelled { .. } => "delivery_cancelled",
            Event::DeliveryConfirmed { .. } => "delivery_confirmed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: Uuid,
    pub channel: Channel,
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
    pub event: Event,
}
