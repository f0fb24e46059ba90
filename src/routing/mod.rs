use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::geo::haversine_km;
use crate::models::driver::GeoPoint;
use crate::models::event::RouteSource;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RoutingError {
    #[error("no route between points")]
    NoRoute,

    #[error("routing service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub distance_m: f64,
    pub duration_secs: u64,
    pub geometry: Vec<GeoPoint>,
}

#[async_trait]
pub trait RoutingOracle: Send + Sync {
    async fn route(&self, origin: GeoPoint, destination: GeoPoint) -> Result<Route, RoutingError>;
}

#[derive(Debug, Clone)]
pub struct StraightLineRouter {
    speed_kmh: f64,
}

impl StraightLineRouter {
    pub fn new(speed_kmh: f64) -> Self {
        Self {
            speed_kmh: speed_kmh.max(1.0),
        }
    }

    pub fn estimate(&self, origin: GeoPoint, destination: GeoPoint) -> Route {
        let distance_km = haversine_km(&origin, &destination);
        let duration_secs = (distance_km / self.speed_kmh * 3_600.0).round() as u64;

        Route {
            distance_m: distance_km * 1_000.0,
            duration_secs,
            geometry: vec![origin, destination],
        }
    }
}

#[async_trait]
impl RoutingOracle for StraightLineRouter {
    async fn route(&self, origin: GeoPoint, destination: GeoPoint) -> Result<Route, RoutingError> {
        Ok(self.estimate(origin, destination))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteEstimate {
    pub route: Route,
    pub source: RouteSource,
}

pub async fn route_or_fallback(
    oracle: &dyn RoutingOracle,
    fallback: &StraightLineRouter,
    timeout: Duration,
    origin: GeoPoint,
    destination: GeoPoint,
) -> RouteEstimate {
    match tokio::time::timeout(timeout, oracle.route(origin, destination)).await {
        Ok(Ok(route)) => RouteEstimate {
            route,
            source: RouteSource::Oracle,
        },
        Ok(Err(err)) => {
            warn!(error = %err, "routing oracle failed; using straight-line estimate");
            RouteEstimate {
                route: fallback.estimate(origin, destination),
                source: RouteSource::StraightLine,
            }
        }
        Err(_elapsed) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "routing oracle timed out; using straight-line estimate");
            RouteEstimate {
                route: fallback.estimate(origin, destination),
                source: RouteSource::StraightLine,
            }
        }
    }
}
