//! Tests for controller metrics

use super::metrics::{create_metrics, ControllerMetrics};

#[test]
fn metrics_creation_and_encoding() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    // Prometheus only emits metrics that have values
    metrics.record_reconciliation_success(0.1);
    metrics.set_canary_weight("default", "checkout", 50);

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains("gateway_cd_reconciliations_total"));
    assert!(output.contains("gateway_cd_reconciliation_duration_seconds"));
    assert!(output.contains("gateway_cd_canary_weight"));
}

#[test]
fn reconciliation_results_are_counted_separately() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    metrics.record_reconciliation_success(0.5);
    metrics.record_reconciliation_success(1.2);
    metrics.record_reconciliation_error();
    metrics.record_reconciliation_skipped();

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains("gateway_cd_reconciliations_total{result=\"success\"} 2"));
    assert!(output.contains("gateway_cd_reconciliations_total{result=\"error\"} 1"));
    assert!(output.contains("gateway_cd_reconciliations_total{result=\"skipped\"} 1"));
    assert!(output.contains("gateway_cd_reconciliation_duration_seconds_count 2"));
}

#[test]
fn canary_weight_gauge_tracks_latest_value() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    metrics.set_canary_weight("shop", "checkout", 10);
    metrics.set_canary_weight("shop", "checkout", 50);

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains(
        "gateway_cd_canary_weight{canarydeployment=\"checkout\",namespace=\"shop\"} 50"
    ));
}

#[test]
fn shared_metrics_handle_is_cloneable() {
    let metrics = create_metrics().expect("should create metrics");
    let clone = metrics.clone();

    metrics.record_reconciliation_success(0.2);
    clone.record_reconciliation_error();

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains("result=\"success\"} 1"));
    assert!(output.contains("result=\"error\"} 1"));
}
