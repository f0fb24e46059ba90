use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    Bike,
    Car,
    Van,
    Truck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub point: GeoPoint,
    pub heading: f64,
    pub speed_kmh: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub name: String,
    pub vehicle: VehicleType,
    pub online: bool,
    pub active_delivery: Option<Uuid>,
    pub position: Option<Position>,
    pub rating: f64,
    pub updated_at: DateTime<Utc>,
}

impl Driver {
    pub fn is_available(&self) -> bool {
        self.online && self.active_delivery.is_none()
    }
}
