//! Controller self-metrics
//!
//! Reconciliation counts/durations and the canary weight gauge, exposed in
//! Prometheus text format via the health server.

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Thread-safe container for all controller metrics. Clone is cheap.
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    /// Total reconciliations by result (success, error, skipped)
    pub reconciliations_total: IntCounterVec,
    /// Reconciliation duration in seconds
    pub reconciliation_duration_seconds: Histogram,
    /// Last enacted canary weight per rollout (0-100)
    pub canary_weight: IntGaugeVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = IntCounterVec::new(
            Opts::new(
                "gateway_cd_reconciliations_total",
                "Total number of reconciliations",
            ),
            &["result"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let reconciliation_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "gateway_cd_reconciliation_duration_seconds",
                "Duration of one reconciliation in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        registry.register(Box::new(reconciliation_duration_seconds.clone()))?;

        let canary_weight = IntGaugeVec::new(
            Opts::new(
                "gateway_cd_canary_weight",
                "Current canary traffic weight percentage",
            ),
            &["namespace", "canarydeployment"],
        )?;
        registry.register(Box::new(canary_weight.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            reconciliation_duration_seconds,
            canary_weight,
        })
    }

    pub fn record_reconciliation_success(&self, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&["success"])
            .inc();
        self.reconciliation_duration_seconds.observe(duration_secs);
    }

    pub fn record_reconciliation_error(&self) {
        self.reconciliations_total
            .with_label_values(&["error"])
            .inc();
    }

    /// Reconcile skipped because this replica is not the leader
    pub fn record_reconciliation_skipped(&self) {
        self.reconciliations_total
            .with_label_values(&["skipped"])
            .inc();
    }

    pub fn set_canary_weight(&self, namespace: &str, name: &str, weight: i64) {
        self.canary_weight
            .with_label_values(&[namespace, name])
            .set(weight);
    }

    /// Encode all metrics to Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
        })
    }
}

/// Shared metrics handle
pub type SharedMetrics = Arc<ControllerMetrics>;

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
