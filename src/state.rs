use std::sync::Arc;

use crate::bus::{InProcessBus, MessageBus};
use crate::config::Config;
use crate::engine::coordinator::{Coordinator, SearchSettings};
use crate::engine::delivery::{DeliveryMachine, DeliverySettings};
use crate::engine::drivers::DriverRegistry;
use crate::engine::fanout::Notifier;
use crate::engine::ledger::Ledger;
use crate::engine::proximity::ProximityIndex;
use crate::engine::retry::RetryPolicy;
use crate::engine::timers::Timers;
use crate::engine::tracker::{LocationTracker, TrackerSettings};
use crate::observability::metrics::Metrics;
use crate::routing::{RoutingOracle, StraightLineRouter};
use crate::store::{InMemoryStore, Persistence};

pub struct AppState {
    pub config: Config,
    pub metrics: Metrics,
    pub drivers: Arc<DriverRegistry>,
    pub proximity: Arc<ProximityIndex>,
    pub coordinator: Arc<Coordinator>,
    pub deliveries: Arc<DeliveryMachine>,
    pub tracker: LocationTracker,
    pub bus: Arc<dyn MessageBus>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn Persistence>,
        bus: Arc<dyn MessageBus>,
        router: Arc<dyn RoutingOracle>,
    ) -> Self {
        let metrics = Metrics::new();
        let retry = RetryPolicy::new(config.retry, metrics.clone());
        let fallback = StraightLineRouter::new(config.fallback_speed_kmh);

        let drivers = Arc::new(DriverRegistry::new());
        let timers = Arc::new(Timers::new());
        let notifier = Arc::new(Notifier::new(bus.clone(), retry.clone()));
        let proximity = Arc::new(ProximityIndex::new(
            drivers.clone(),
            config.staleness_threshold,
            config.max_clock_skew,
            fallback.clone(),
        ));

        let deliveries = Arc::new(DeliveryMachine::new(
            store.clone(),
            retry.clone(),
            metrics.clone(),
            drivers.clone(),
            notifier.clone(),
            timers.clone(),
            DeliverySettings {
                commission_rate: config.commission_rate,
                auto_confirm_after: config.auto_confirm_after,
            },
        ));

        let coordinator = Arc::new(Coordinator::new(
            drivers.clone(),
            proximity.clone(),
            Ledger::new(store.clone(), retry.clone(), metrics.clone()),
            deliveries.clone(),
            notifier.clone(),
            timers,
            router.clone(),
            fallback.clone(),
            metrics.clone(),
            SearchSettings {
                search_radius_km: config.search_radius_km,
                radius_growth_factor: config.radius_growth_factor,
                max_search_attempts: config.max_search_attempts,
                request_ttl: config.request_ttl,
                routing_timeout: config.routing_timeout,
                session_retention: config.session_retention,
            },
        ));

        let tracker = LocationTracker::new(
            drivers.clone(),
            deliveries.clone(),
            store,
            retry,
            notifier,
            router,
            fallback,
            metrics.clone(),
            TrackerSettings {
                eta_cadence: config.eta_cadence,
                eta_min_displacement_m: config.eta_min_displacement_m,
                routing_timeout: config.routing_timeout,
                max_clock_skew: config.max_clock_skew,
            },
        );

        Self {
            config,
            metrics,
            drivers,
            proximity,
            coordinator,
            deliveries,
            tracker,
            bus,
        }
    }

    pub fn in_memory(config: Config) -> Self {
        let bus = Arc::new(InProcessBus::new(config.event_buffer_size));
        let router = Arc::new(StraightLineRouter::new(config.fallback_speed_kmh));
        Self::new(config, Arc::new(InMemoryStore::new()), bus, router)
    }
}
