use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Prometheus-backed counters/gauges for the renewer, following the
/// `Registry`/`IntCounterVec` construction style of
/// `integration-gateway/src/metrics.rs` and `common/observability`. Not
/// exposed over HTTP by this crate — see SPEC_FULL.md §1A.
#[derive(Clone)]
pub struct RenewerMetrics {
    registry: Registry,
    renewals_succeeded: IntCounter,
    renewals_failed: IntCounter,
    dedup_hits: IntCounter,
    malformed_requests: IntCounter,
    pool_capacity: IntGauge,
    pool_in_flight: IntGauge,
}

impl RenewerMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let renewals_succeeded = IntCounter::with_opts(Opts::new(
            "auth_renewer_renewals_succeeded_total",
            "Renewal tasks that wrote a fresh authorization to the cache",
        ))?;
        let renewals_failed = IntCounter::with_opts(Opts::new(
            "auth_renewer_renewals_failed_total",
            "Renewal tasks that failed before writing to the cache",
        ))?;
        let dedup_hits = IntCounter::with_opts(Opts::new(
            "auth_renewer_dedup_hits_total",
            "Incoming requests skipped because a renewal for the same application/metric was already in flight",
        ))?;
        let malformed_requests = IntCounter::with_opts(Opts::new(
            "auth_renewer_malformed_requests_total",
            "Request channel messages that failed to parse and were skipped",
        ))?;
        let pool_capacity = IntGauge::with_opts(Opts::new(
            "auth_renewer_pool_capacity",
            "Configured maximum number of concurrent renewal tasks",
        ))?;
        let pool_in_flight = IntGauge::with_opts(Opts::new(
            "auth_renewer_pool_in_flight",
            "Renewal tasks currently running",
        ))?;

        registry.register(Box::new(renewals_succeeded.clone()))?;
        registry.register(Box::new(renewals_failed.clone()))?;
        registry.register(Box::new(dedup_hits.clone()))?;
        registry.register(Box::new(malformed_requests.clone()))?;
        registry.register(Box::new(pool_capacity.clone()))?;
        registry.register(Box::new(pool_in_flight.clone()))?;

        Ok(Self {
            registry,
            renewals_succeeded,
            renewals_failed,
            dedup_hits,
            malformed_requests,
            pool_capacity,
            pool_in_flight,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_renewal_success(&self) {
        self.renewals_succeeded.inc();
    }

    pub fn record_renewal_failure(&self) {
        self.renewals_failed.inc();
    }

    pub fn record_dedup_hit(&self) {
        self.dedup_hits.inc();
    }

    pub fn record_malformed_request(&self) {
        self.malformed_requests.inc();
    }

    pub fn set_pool_capacity(&self, capacity: i64) {
        self.pool_capacity.set(capacity);
    }

    pub fn set_pool_in_flight(&self, in_flight: i64) {
        self.pool_in_flight.set(in_flight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let metrics = RenewerMetrics::new().unwrap();
        assert_eq!(metrics.renewals_succeeded.get(), 0);
        metrics.record_renewal_success();
        assert_eq!(metrics.renewals_succeeded.get(), 1);
    }
}
