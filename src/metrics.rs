use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the rate limit engine
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Decision metrics
    decisions: CounterVec,

    // Store metrics
    store_operation_duration: HistogramVec,
    store_errors: CounterVec,

    // Registration metrics
    route_registrations: CounterVec,
    config_load_success: Counter,
    config_load_error: Counter,

    request_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let decisions = CounterVec::new(
            Opts::new(
                "ratelimit_decisions_total",
                "Rate limit decisions by scope and outcome",
            ),
            &["scope", "outcome"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "ratelimit_store_operation_duration_seconds",
                "Duration of counter store increments in seconds",
            ),
            &["scope"],
        )?;

        let store_errors = CounterVec::new(
            Opts::new(
                "ratelimit_store_errors_total",
                "Counter store failures by scope and handling",
            ),
            &["scope", "handling"],
        )?;

        let route_registrations = CounterVec::new(
            Opts::new(
                "ratelimit_route_registrations_total",
                "Routes registered with a rate limiter",
            ),
            &["state"],
        )?;

        let config_load_success = Counter::new(
            "ratelimit_config_load_success",
            "Number of successful configuration loads",
        )?;

        let config_load_error = Counter::new(
            "ratelimit_config_load_error",
            "Number of failed configuration loads",
        )?;

        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "ratelimit_request_duration_seconds",
            "Duration of rate limit checks in seconds",
        ))?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(route_registrations.clone()))?;
        registry.register(Box::new(config_load_success.clone()))?;
        registry.register(Box::new(config_load_error.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            decisions,
            store_operation_duration,
            store_errors,
            route_registrations,
            config_load_success,
            config_load_error,
            request_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one decision: `admitted`, `exceeded`, `banned` or `allow_listed`
    pub fn record_outcome(&self, scope: &str, outcome: &str) {
        self.decisions.with_label_values(&[scope, outcome]).inc();
    }

    pub fn record_store_duration(&self, scope: &str, duration_seconds: f64) {
        self.store_operation_duration
            .with_label_values(&[scope])
            .observe(duration_seconds);
    }

    /// Record a store failure and whether it was `skipped` or `propagated`
    pub fn record_store_error(&self, scope: &str, handling: &str) {
        self.store_errors.with_label_values(&[scope, handling]).inc();
    }

    pub fn record_route_registration(&self, state: &str) {
        self.route_registrations.with_label_values(&[state]).inc();
    }

    /// Record successful configuration load
    pub fn record_config_load_success(&self) {
        self.config_load_success.inc();
    }

    /// Record failed configuration load
    pub fn record_config_load_error(&self) {
        self.config_load_error.inc();
    }

    /// Create a timer for measuring check duration
    pub fn start_request_timer(&self) -> prometheus::HistogramTimer {
        self.request_duration.start_timer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.record_outcome("ratelimit-", "admitted");
        metrics.record_store_duration("ratelimit-", 0.001);
        metrics.record_store_error("ratelimit-", "skipped");
        metrics.record_route_registration("limited");
        metrics.record_config_load_success();

        let _timer = metrics.start_request_timer();
    }

    #[test]
    fn test_metrics_gathering() {
        let metrics = Metrics::new().unwrap();

        metrics.record_outcome("ratelimit-", "exceeded");
        metrics.record_outcome("ratelimit-", "exceeded");

        let families = metrics.registry().gather();
        let decisions = families
            .iter()
            .find(|f| f.get_name() == "ratelimit_decisions_total")
            .unwrap();
        assert_eq!(decisions.get_metric()[0].get_counter().get_value(), 2.0);
    }
}
