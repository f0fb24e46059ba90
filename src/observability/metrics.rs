use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub booking_requests_total: IntCounterVec,
    pub booking_resolutions_total: IntCounterVec,
    pub dispatch_latency_seconds: HistogramVec,
    pub active_search_sessions: IntGauge,
    pub settlements_total: IntCounterVec,
    pub location_samples_total: IntCounterVec,
    pub eta_recomputes_total: IntCounterVec,
    pub collaborator_retries_total: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let booking_requests_total = IntCounterVec::new(
            Opts::new("booking_requests_total", "Booking requests created by dispatch mode"),
            &["mode"],
        )
        .expect("valid booking_requests_total metric");

        let booking_resolutions_total = IntCounterVec::new(
            Opts::new(
                "booking_resolutions_total",
                "Booking requests resolved by final status",
            ),
            &["outcome"],
        )
        .expect("valid booking_resolutions_total metric");

        let dispatch_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "dispatch_latency_seconds",
                "Time from request creation to resolution in seconds",
            )
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0]),
            &["outcome"],
        )
        .expect("valid dispatch_latency_seconds metric");

        let active_search_sessions = IntGauge::new(
            "active_search_sessions",
            "Customer search sessions not yet accepted or cancelled",
        )
        .expect("valid active_search_sessions metric");

        let settlements_total = IntCounterVec::new(
            Opts::new("settlements_total", "Delivery settlements by confirmation source"),
            &["source"],
        )
        .expect("valid settlements_total metric");

        let location_samples_total = IntCounterVec::new(
            Opts::new("location_samples_total", "Driver location samples by outcome"),
            &["outcome"],
        )
        .expect("valid location_samples_total metric");

        let eta_recomputes_total = IntCounterVec::new(
            Opts::new("eta_recomputes_total", "ETA recomputations by route source"),
            &["source"],
        )
        .expect("valid eta_recomputes_total metric");

        let collaborator_retries_total = IntCounterVec::new(
            Opts::new(
                "collaborator_retries_total",
                "Retries of store and bus calls after transient failures",
            ),
            &["operation"],
        )
        .expect("valid collaborator_retries_total metric");

        registry
            .register(Box::new(booking_requests_total.clone()))
            .expect("register booking_requests_total");
        registry
            .register(Box::new(booking_resolutions_total.clone()))
            .expect("register booking_resolutions_total");
        registry
            .register(Box::new(dispatch_latency_seconds.clone()))
            .expect("register dispatch_latency_seconds");
        registry
            .register(Box::new(active_search_sessions.clone()))
            .expect("register active_search_sessions");
        registry
            .register(Box::new(settlements_total.clone()))
            .expect("register settlements_total");
        registry
            .register(Box::new(location_samples_total.clone()))
            .expect("register location_samples_total");
        registry
            .register(Box::new(eta_recomputes_total.clone()))
            .expect("register eta_recomputes_total");
        registry
            .register(Box::new(collaborator_retries_total.clone()))
            .expect("register collaborator_retries_total");

        Self {
            registry,
            booking_requests_total,
            booking_resolutions_total,
            dispatch_latency_seconds,
            active_search_sessions,
            settlements_total,
            location_samples_total,
            eta_recomputes_total,
            collaborator_retries_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
