//! Tests for controller metrics

use super::metrics::{create_metrics, ControllerMetrics};

#[test]
fn test_metrics_creation() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    // Prometheus only outputs labelled metrics once they have values
    metrics.record_reconciliation_success(0.1, 2);
    metrics.record_operation("create", true);

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains("kehto_reconciliations_total"));
    assert!(output.contains("kehto_reconciliation_duration_seconds"));
    assert!(output.contains("kehto_clusters_known"));
    assert!(output.contains("kehto_cluster_operations_total"));
}

#[test]
fn test_record_reconciliation_success() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    metrics.record_reconciliation_success(0.5, 1);
    metrics.record_reconciliation_success(1.2, 3);

    let output = metrics.encode().expect("should encode metrics");

    assert!(output.contains("kehto_reconciliations_total{result=\"success\"} 2"));
    assert!(output.contains("kehto_reconciliation_duration_seconds_count 2"));
    assert!(output.contains("kehto_clusters_known 3"));
}

#[test]
fn test_record_reconciliation_error() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    metrics.record_reconciliation_error(2.0, 1);

    let output = metrics.encode().expect("should encode metrics");

    assert!(output.contains("kehto_reconciliations_total{result=\"error\"} 1"));
    assert!(output.contains("kehto_reconciliation_duration_seconds_count 1"));
    assert!(output.contains("kehto_clusters_known 1"));
}

#[test]
fn test_record_operations() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    metrics.record_operation("create", true);
    metrics.record_operation("create", false);
    metrics.record_operation("destroy", true);
    metrics.record_operation("destroy", true);

    let output = metrics.encode().expect("should encode metrics");

    assert!(output
        .contains("kehto_cluster_operations_total{operation=\"create\",result=\"success\"} 1"));
    assert!(
        output.contains("kehto_cluster_operations_total{operation=\"create\",result=\"error\"} 1")
    );
    assert!(output
        .contains("kehto_cluster_operations_total{operation=\"destroy\",result=\"success\"} 2"));
}

#[test]
fn test_shared_metrics() {
    let metrics = create_metrics().expect("should create shared metrics");
    let clone = metrics.clone();

    clone.record_operation("destroy", false);

    let output = metrics.encode().expect("should encode metrics");
    assert!(
        output.contains("kehto_cluster_operations_total{operation=\"destroy\",result=\"error\"} 1")
    );
}
