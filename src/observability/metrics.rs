use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub claims_total: IntCounterVec,
    pub transitions_total: IntCounterVec,
    pub location_writes_total: IntCounterVec,
    pub route_computations_total: IntCounterVec,
    pub route_query_latency_seconds: Histogram,
    pub active_location_trackers: IntGauge,
    pub active_route_trackers: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let claims_total = IntCounterVec::new(
            Opts::new("claims_total", "Order claims by outcome (won, lost, rejected, error)"),
            &["outcome"],
        )
        .expect("valid claims_total metric");

        let transitions_total = IntCounterVec::new(
            Opts::new("transitions_total", "Order status transitions by outcome"),
            &["outcome"],
        )
        .expect("valid transitions_total metric");

        let location_writes_total = IntCounterVec::new(
            Opts::new(
                "location_writes_total",
                "Worker location samples by throttle outcome",
            ),
            &["outcome"],
        )
        .expect("valid location_writes_total metric");

        let route_computations_total = IntCounterVec::new(
            Opts::new(
                "route_computations_total",
                "Route cache decisions by outcome",
            ),
            &["outcome"],
        )
        .expect("valid route_computations_total metric");

        let route_query_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "route_query_latency_seconds",
            "Latency of external route queries in seconds",
        ))
        .expect("valid route_query_latency_seconds metric");

        let active_location_trackers = IntGauge::new(
            "active_location_trackers",
            "Location reporters currently sampling",
        )
        .expect("valid active_location_trackers metric");

        let active_route_trackers =
            IntGauge::new("active_route_trackers", "Route trackers currently running")
                .expect("valid active_route_trackers metric");

        registry
            .register(Box::new(claims_total.clone()))
            .expect("register claims_total");
        registry
            .register(Box::new(transitions_total.clone()))
            .expect("register transitions_total");
        registry
            .register(Box::new(location_writes_total.clone()))
            .expect("register location_writes_total");
        registry
            .register(Box::new(route_computations_total.clone()))
            .expect("register route_computations_total");
        registry
            .register(Box::new(route_query_latency_seconds.clone()))
            .expect("register route_query_latency_seconds");
        registry
            .register(Box::new(active_location_trackers.clone()))
            .expect("register active_location_trackers");
        registry
            .register(Box::new(active_route_trackers.clone()))
            .expect("register active_route_trackers");

        Self {
            registry,
            claims_total,
            transitions_total,
            location_writes_total,
            route_computations_total,
            route_query_latency_seconds,
            active_location_trackers,
            active_route_trackers,
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
