//! Prometheus metrics for the kehto controller
//!
//! Exposes reconciliation health and cluster operation activity:
//! - Reconciliation counts and durations
//! - Number of clusters known after the last pass
//! - Create/destroy outcomes

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Controller metrics registry
///
/// Thread-safe container for all Prometheus metrics.
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    /// Total reconciliation passes by result (success, error)
    pub reconciliations_total: IntCounterVec,
    /// Reconciliation pass duration in seconds
    pub reconciliation_duration_seconds: Histogram,
    /// Clusters listed by the provisioning tool in the last pass
    pub clusters_known: IntGauge,
    /// Cluster operations by kind (create, destroy) and result
    pub cluster_operations_total: IntCounterVec,
}

impl ControllerMetrics {
    /// Create a new metrics registry with all kehto metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = IntCounterVec::new(
            Opts::new(
                "kehto_reconciliations_total",
                "Total number of reconciliation passes",
            ),
            &["result"], // success, error
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        // passes include kubeconfig polling, so allow for long tails
        let reconciliation_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "kehto_reconciliation_duration_seconds",
                "Duration of reconciliation passes in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        registry.register(Box::new(reconciliation_duration_seconds.clone()))?;

        let clusters_known = IntGauge::new(
            "kehto_clusters_known",
            "Number of clusters seen in the last reconciliation",
        )?;
        registry.register(Box::new(clusters_known.clone()))?;

        let cluster_operations_total = IntCounterVec::new(
            Opts::new(
                "kehto_cluster_operations_total",
                "Total number of cluster create/destroy operations",
            ),
            &["operation", "result"],
        )?;
        registry.register(Box::new(cluster_operations_total.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            reconciliation_duration_seconds,
            clusters_known,
            cluster_operations_total,
        })
    }

    /// Record a reconciliation pass that regenerated (or kept) the kubeconfig
    pub fn record_reconciliation_success(&self, duration_secs: f64, clusters: usize) {
        self.reconciliations_total
            .with_label_values(&["success"])
            .inc();
        self.reconciliation_duration_seconds.observe(duration_secs);
        self.clusters_known.set(clusters as i64);
    }

    /// Record a pass whose kubeconfig merge failed
    ///
    /// The cluster list is still refreshed in that case, so the gauge moves too.
    pub fn record_reconciliation_error(&self, duration_secs: f64, clusters: usize) {
        self.reconciliations_total
            .with_label_values(&["error"])
            .inc();
        self.reconciliation_duration_seconds.observe(duration_secs);
        self.clusters_known.set(clusters as i64);
    }

    pub fn record_operation(&self, operation: &str, success: bool) {
        let result = if success { "success" } else { "error" };
        self.cluster_operations_total
            .with_label_values(&[operation, result])
            .inc();
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

/// Shared metrics handle for use across the controller
pub type SharedMetrics = Arc<ControllerMetrics>;

/// Create a new shared metrics instance
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
