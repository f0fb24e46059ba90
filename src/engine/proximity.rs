use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::engine::drivers::DriverRegistry;
use crate::geo::haversine_km;
use crate::models::driver::{Driver, GeoPoint, VehicleType};
use crate::models::session::Candidate;
use crate::routing::StraightLineRouter;

pub struct ProximityIndex {
    drivers: Arc<DriverRegistry>,
    staleness_threshold: Duration,
    max_clock_skew: Duration,
    eta: StraightLineRouter,
}

impl ProximityIndex {
    pub fn new(
        drivers: Arc<DriverRegistry>,
        staleness_threshold: Duration,
        max_clock_skew: Duration,
        eta: StraightLineRouter,
    ) -> Self {
        Self {
            drivers,
            staleness_threshold,
            max_clock_skew,
            eta,
        }
    }

    pub fn find_candidates(
        &self,
        origin: GeoPoint,
        radius_km: f64,
        vehicle: Option<VehicleType>,
        now: DateTime<Utc>,
    ) -> Vec<Candidate> {
        let mut candidates = Vec::new();

        self.drivers.for_each(|driver| {
            if let Some(candidate) = self.evaluate(driver, origin, radius_km, vehicle, now) {
                candidates.push(candidate);
            }
        });

        candidates.sort_by(rank);
        candidates
    }

    fn evaluate(
        &self,
        driver: &Driver,
        origin: GeoPoint,
        radius_km: f64,
        vehicle: Option<VehicleType>,
        now: DateTime<Utc>,
    ) -> Option<Candidate> {
        if !driver.is_available() {
            return None;
        }
        if vehicle.is_some_and(|wanted| wanted != driver.vehicle) {
            return None;
        }

        let position = driver.position.as_ref()?;
        if !self.is_fresh(position.recorded_at, now) {
            return None;
        }

        let distance_km = haversine_km(&position.point, &origin);
        if distance_km > radius_km {
            return None;
        }

        Some(Candidate {
            driver_id: driver.id,
            name: driver.name.clone(),
            vehicle: driver.vehicle,
            rating: driver.rating,
            distance_km,
            eta_secs: self.eta.estimate(position.point, origin).duration_secs,
        })
    }

    fn is_fresh(&self, recorded_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match (now - recorded_at).to_std() {
            Ok(age) => age < self.staleness_threshold,
            // stamped ahead of our clock: tolerated only within the skew
            Err(_) => (recorded_at - now)
                .to_std()
                .is_ok_and(|ahead| ahead <= self.max_clock_skew),
        }
    }
}

fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    a.distance_km
        .total_cmp(&b.distance_km)
        .then_with(|| b.rating.total_cmp(&a.rating))
        .then_with(|| a.driver_id.cmp(&b.driver_id))
}
