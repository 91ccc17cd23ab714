//! Prometheus metrics for the faucet

use prometheus::{
    histogram_opts, opts, Counter, Encoder, Gauge, Histogram, IntCounterVec, Registry, TextEncoder,
};
use std::time::Duration;
use tracing::{debug, info};

/// Process-local faucet metrics. Each instance owns its registry so tests can
/// build as many as they like.
#[derive(Debug)]
pub struct FaucetMetrics {
    registry: Registry,

    // Request outcomes
    pub requests_total: Counter,
    pub requests_success_total: Counter,
    pub requests_failed_total: Counter,
    pub rate_limited_total: IntCounterVec,
    pub dispatch_duration: Histogram,

    // Reserve
    pub reserve_balance: Gauge,

    // Recorder health
    pub recorder_dropped_total: Counter,
    pub recorder_errors_total: Counter,
}

impl FaucetMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = Counter::with_opts(opts!(
            "faucet_requests_total",
            "Total number of dispatch attempts recorded"
        ))?;

        let requests_success_total = Counter::with_opts(opts!(
            "faucet_requests_success_total",
            "Total number of successful transfers"
        ))?;

        let requests_failed_total = Counter::with_opts(opts!(
            "faucet_requests_failed_total",
            "Total number of dispatch attempts that did not transfer"
        ))?;

        let rate_limited_total = IntCounterVec::new(
            opts!("faucet_rate_limited_total", "Requests denied by a rate limit tier"),
            &["scope"],
        )?;

        let dispatch_duration = Histogram::with_opts(histogram_opts!(
            "faucet_dispatch_duration_seconds",
            "Time spent dispatching a faucet request"
        ))?;

        let reserve_balance = Gauge::with_opts(opts!(
            "faucet_reserve_balance",
            "Last observed faucet reserve balance in base units"
        ))?;

        let recorder_dropped_total = Counter::with_opts(opts!(
            "faucet_recorder_dropped_total",
            "Outcome records dropped because the recorder queue was full"
        ))?;

        let recorder_errors_total = Counter::with_opts(opts!(
            "faucet_recorder_errors_total",
            "Counter or ledger writes that failed in the recorder"
        ))?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(requests_success_total.clone()))?;
        registry.register(Box::new(requests_failed_total.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;
        registry.register(Box::new(dispatch_duration.clone()))?;
        registry.register(Box::new(reserve_balance.clone()))?;
        registry.register(Box::new(recorder_dropped_total.clone()))?;
        registry.register(Box::new(recorder_errors_total.clone()))?;

        info!("Faucet metrics initialized");
        Ok(Self {
            registry,
            requests_total,
            requests_success_total,
            requests_failed_total,
            rate_limited_total,
            dispatch_duration,
            reserve_balance,
            recorder_dropped_total,
            recorder_errors_total,
        })
    }

    pub fn record_rate_limited(&self, scope: &str) {
        self.rate_limited_total.with_label_values(&[scope]).inc();
        debug!("Recorded rate limit denial: {}", scope);
    }

    pub fn record_outcome(&self, success: bool) {
        self.requests_total.inc();
        if success {
            self.requests_success_total.inc();
        } else {
            self.requests_failed_total.inc();
        }
    }

    pub fn observe_dispatch(&self, elapsed: Duration) {
        self.dispatch_duration.observe(elapsed.as_secs_f64());
    }

    pub fn set_reserve_balance(&self, balance: u64) {
        self.reserve_balance.set(balance as f64);
    }

    /// Text exposition format for `/metrics`.
    pub fn gather(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
