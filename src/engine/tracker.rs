use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::delivery::DeliveryMachine;
use crate::engine::drivers::DriverRegistry;
use crate::engine::fanout::{Notifier, Transition};
use crate::engine::retry::RetryPolicy;
use crate::error::AppError;
use crate::geo::{bearing_deg, haversine_km};
use crate::models::delivery::{Delivery, DeliveryStatus};
use crate::models::driver::{GeoPoint, Position};
use crate::models::event::EtaTarget;
use crate::models::location::LocationSample;
use crate::observability::metrics::Metrics;
use crate::routing::{route_or_fallback, RoutingOracle, StraightLineRouter};
use crate::store::Persistence;

pub struct TrackerSettings {
    pub eta_cadence: Duration,
    pub eta_min_displacement_m: f64,
    pub routing_timeout: Duration,
    pub max_clock_skew: Duration,
}

#[derive(Debug, Clone)]
pub struct LocationUpdate {
    pub point: GeoPoint,
    pub heading: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted {
        sample: LocationSample,
        eta_recomputed: bool,
    },
    OutOfOrder { last_recorded_at: DateTime<Utc> },
}

struct EtaMark {
    delivery_id: Uuid,
    target: EtaTarget,
    point: GeoPoint,
    at: DateTime<Utc>,
}

#[derive(Default)]
struct Track {
    last: Option<LocationSample>,
    last_eta: Option<EtaMark>,
    hydrated: bool,
}

pub struct LocationTracker {
    tracks: DashMap<Uuid, Arc<Mutex<Track>>>,
    drivers: Arc<DriverRegistry>,
    deliveries: Arc<DeliveryMachine>,
    store: Arc<dyn Persistence>,
    retry: RetryPolicy,
    notifier: Arc<Notifier>,
    router: Arc<dyn RoutingOracle>,
    fallback: StraightLineRouter,
    metrics: Metrics,
    settings: TrackerSettings,
}

impl LocationTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        drivers: Arc<DriverRegistry>,
        deliveries: Arc<DeliveryMachine>,
        store: Arc<dyn Persistence>,
        retry: RetryPolicy,
        notifier: Arc<Notifier>,
        router: Arc<dyn RoutingOracle>,
        fallback: StraightLineRouter,
        metrics: Metrics,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            tracks: DashMap::new(),
            drivers,
            deliveries,
            store,
            retry,
            notifier,
            router,
            fallback,
            metrics,
            settings,
        }
    }

    pub async fn ingest(
        &self,
        driver_id: Uuid,
        update: LocationUpdate,
    ) -> Result<IngestOutcome, AppError> {
        if let Err(err) = validate(&update, Utc::now(), self.settings.max_clock_skew) {
            self.record("invalid");
            return Err(err);
        }
        if self.drivers.get(driver_id).is_none() {
            return Err(AppError::NotFound(format!("driver {driver_id} not found")));
        }

        let cell = self
            .tracks
            .entry(driver_id)
            .or_default()
            .value()
            .clone();
        let mut track = cell.lock().await;

        if !track.hydrated {
            track.last = self
                .retry
                .transient("load_location", || self.store.load_location(driver_id))
                .await?;
            track.hydrated = true;
        }

        if let Some(last) = &track.last {
            if update.recorded_at < last.recorded_at {
                debug!(
                    driver_id = %driver_id,
                    recorded_at = %update.recorded_at,
                    last_recorded_at = %last.recorded_at,
                    "dropping out-of-order location sample"
                );
                self.record("out_of_order");
                return Ok(IngestOutcome::OutOfOrder {
                    last_recorded_at: last.recorded_at,
                });
            }
        }

        let sample = derive_sample(driver_id, &update, track.last.as_ref());

        self.drivers.update_position(
            driver_id,
            Position {
                point: sample.point,
                heading: sample.heading,
                speed_kmh: sample.speed_kmh,
                recorded_at: sample.recorded_at,
            },
        )?;
        self.retry
            .transient("upsert_location", || self.store.upsert_location(&sample))
            .await?;
        track.last = Some(sample.clone());
        self.record("accepted");

        let eta_recomputed = match self.deliveries.active_for_driver(driver_id).await? {
            Some(delivery) => self.follow(&mut track, &delivery, &sample).await,
            None => false,
        };

        Ok(IngestOutcome::Accepted {
            sample,
            eta_recomputed,
        })
    }

    async fn follow(&self, track: &mut Track, delivery: &Delivery, sample: &LocationSample) -> bool {
        self.notifier
            .notify(Transition::DriverMoved { delivery, sample })
            .await;

        let (target, destination) = match delivery.status {
            DeliveryStatus::Accepted => (EtaTarget::Pickup, delivery.pickup.point),
            _ => (EtaTarget::Dropoff, delivery.dropoff.point),
        };

        if !self.eta_due(track.last_eta.as_ref(), delivery.id, target, sample) {
            return false;
        }

        let estimate = route_or_fallback(
            self.router.as_ref(),
            &self.fallback,
            self.settings.routing_timeout,
            sample.point,
            destination,
        )
        .await;

        self.metrics
            .eta_recomputes_total
            .with_label_values(&[estimate.source.as_str()])
            .inc();
        track.last_eta = Some(EtaMark {
            delivery_id: delivery.id,
            target,
            point: sample.point,
            at: sample.recorded_at,
        });

        self.notifier
            .notify(Transition::EtaUpdated {
                delivery,
                target,
                estimate: &estimate,
            })
            .await;
        true
    }

    fn eta_due(
        &self,
        mark: Option<&EtaMark>,
        delivery_id: Uuid,
        target: EtaTarget,
        sample: &LocationSample,
    ) -> bool {
        let Some(mark) = mark else {
            return true;
        };
        if mark.delivery_id != delivery_id || mark.target != target {
            return true;
        }

        let elapsed = (sample.recorded_at - mark.at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let moved_m = haversine_km(&mark.point, &sample.point) * 1_000.0;

        elapsed >= self.settings.eta_cadence || moved_m >= self.settings.eta_min_displacement_m
    }

    fn record(&self, outcome: &str) {
        self.metrics
            .location_samples_total
            .with_label_values(&[outcome])
            .inc();
    }
}

fn validate(
    update: &LocationUpdate,
    now: DateTime<Utc>,
    max_clock_skew: Duration,
) -> Result<(), AppError> {
    let ahead = (update.recorded_at - now).to_std().unwrap_or(Duration::ZERO);
    if ahead > max_clock_skew {
        return Err(AppError::Validation(format!(
            "recorded_at is {}s ahead of server time",
            ahead.as_secs()
        )));
    }
    if !update.point.is_valid() {
        return Err(AppError::Validation(
            "coordinates out of range".to_string(),
        ));
    }
    if let Some(heading) = update.heading {
        if !(0.0..360.0).contains(&heading) {
            return Err(AppError::Validation(
                "heading must be in [0, 360)".to_string(),
            ));
        }
    }
    if let Some(speed) = update.speed_kmh {
        if !speed.is_finite() || speed < 0.0 {
            return Err(AppError::Validation(
                "speed cannot be negative".to_string(),
            ));
        }
    }
    Ok(())
}

fn derive_sample(
    driver_id: Uuid,
    update: &LocationUpdate,
    previous: Option<&LocationSample>,
) -> LocationSample {
    let (derived_heading, derived_speed) = match previous {
        Some(prev) => {
            let distance_km = haversine_km(&prev.point, &update.point);
            let heading = if distance_km > 0.0 {
                bearing_deg(&prev.point, &update.point)
            } else {
                prev.heading
            };
            let elapsed_secs = (update.recorded_at - prev.recorded_at).num_milliseconds() as f64 / 1_000.0;
            let speed = if elapsed_secs > 0.0 {
                distance_km / (elapsed_secs / 3_600.0)
            } else {
                prev.speed_kmh
            };
            (heading, speed)
        }
        None => (0.0, 0.0),
    };

    if update.speed_kmh.is_none() && derived_speed > 250.0 {
        warn!(driver_id = %driver_id, speed_kmh = derived_speed, "implausible derived speed");
    }

    LocationSample {
        driver_id,
        point: update.point,
        heading: update.heading.unwrap_or(derived_heading),
        speed_kmh: update.speed_kmh.unwrap_or(derived_speed),
        recorded_at: update.recorded_at,
    }
}
