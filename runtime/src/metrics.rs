//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the sync pipeline:
//! - Reconcile outcomes per intent
//! - Payload throughput and latency
//! - Malformed payloads, dead letters and redeliveries
//! - Store failures
//!
//! # Example
//!
//! ```rust,no_run
//! use allocation_sync_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use allocation_sync_core::ReconcileOutcome;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this logs
    /// a warning and leaves [`handle`](Self::handle) empty.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = configured_builder()?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        if let Err(e) = metrics::set_global_recorder(recorder) {
            tracing::warn!(error = %e, "Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            // `ExporterError` implements neither `Display` nor `Debug` in
            // metrics-exporter-prometheus 0.15, so it cannot be logged.
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn configured_builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        // Configure histogram buckets for latency measurements
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "inventory_sync_payloads_total",
        "Total number of inbound payloads fully processed"
    );
    describe_counter!(
        "inventory_sync_intents_total",
        "Total number of intents reconciled, by outcome and discard reason"
    );
    describe_counter!(
        "inventory_sync_malformed_total",
        "Total number of payloads rejected as malformed"
    );
    describe_counter!(
        "inventory_sync_store_errors_total",
        "Total number of payloads that failed on the record store"
    );
    describe_counter!(
        "inventory_sync_dead_lettered_total",
        "Total number of payloads parked in the dead letter queue"
    );
    describe_counter!(
        "inventory_sync_redeliveries_total",
        "Total number of redelivery requests sent to the transport"
    );
    describe_counter!(
        "inventory_sync_dlq_resolved_total",
        "Total number of dead letter entries marked resolved"
    );
    describe_counter!(
        "inventory_sync_dlq_discarded_total",
        "Total number of dead letter entries marked discarded"
    );
    describe_histogram!(
        "inventory_sync_reconcile_duration_seconds",
        "Time taken to reconcile one intent against the store"
    );
}

/// Sync pipeline metrics recorder.
pub struct SyncMetrics;

impl SyncMetrics {
    /// Record the outcome of one reconcile call.
    pub fn record_outcome(outcome: &ReconcileOutcome, duration: Duration) {
        let reason = match outcome {
            ReconcileOutcome::Discarded { reason } => reason.as_str(),
            _ => "none",
        };
        counter!("inventory_sync_intents_total", "outcome" => outcome.as_str(), "reason" => reason)
            .increment(1);
        histogram!("inventory_sync_reconcile_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a payload whose every intent was reconciled.
    pub fn record_payload() {
        counter!("inventory_sync_payloads_total").increment(1);
    }

    /// Record a malformed payload.
    pub fn record_malformed() {
        counter!("inventory_sync_malformed_total").increment(1);
    }

    /// Record a store failure.
    pub fn record_store_error() {
        counter!("inventory_sync_store_errors_total").increment(1);
    }

    /// Record a parked payload.
    pub fn record_dead_lettered() {
        counter!("inventory_sync_dead_lettered_total").increment(1);
    }

    /// Record a redelivery request.
    pub fn record_redelivery() {
        counter!("inventory_sync_redeliveries_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use allocation_sync_core::DiscardReason;

    fn recorded(f: impl FnOnce()) -> String {
        let recorder = configured_builder().unwrap().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, f);
        handle.render()
    }

    #[test]
    fn test_metrics_server_creation() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn outcomes_are_labelled() {
        let rendered = recorded(|| {
            SyncMetrics::record_outcome(&ReconcileOutcome::Inserted, Duration::from_millis(2));
            SyncMetrics::record_outcome(
                &ReconcileOutcome::Discarded {
                    reason: DiscardReason::Stale,
                },
                Duration::from_millis(1),
            );
        });

        assert!(rendered.contains(r#"inventory_sync_intents_total{outcome="inserted",reason="none"} 1"#));
        assert!(rendered.contains(r#"inventory_sync_intents_total{outcome="discarded",reason="stale"} 1"#));
        assert!(rendered.contains("inventory_sync_reconcile_duration_seconds_bucket"));
    }

    #[test]
    fn pipeline_counters() {
        let rendered = recorded(|| {
            SyncMetrics::record_payload();
            SyncMetrics::record_malformed();
            SyncMetrics::record_dead_lettered();
            SyncMetrics::record_store_error();
            SyncMetrics::record_redelivery();
            SyncMetrics::record_redelivery();
        });

        assert!(rendered.contains("inventory_sync_payloads_total 1"));
        assert!(rendered.contains("inventory_sync_malformed_total 1"));
        assert!(rendered.contains("inventory_sync_dead_lettered_total 1"));
        assert!(rendered.contains("inventory_sync_store_errors_total 1"));
        assert!(rendered.contains("inventory_sync_redeliveries_total 2"));
    }
}
