use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::GeoPoint;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSample {
    pub driver_id: Uuid,
    pub point: GeoPoint,
    pub heading: f64,
    pub speed_kmh: f64,
    pub recorded_at: DateTime<Utc>,
}
