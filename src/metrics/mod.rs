//! Prometheus metrics module

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Gateway metrics collector
#[derive(Clone)]
pub struct GatewayMetrics {
    handle: Arc<PrometheusHandle>,
}

impl GatewayMetrics {
    /// Initialize metrics and return handle
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus recorder");

        Self::register_metrics();

        Self {
            handle: Arc::new(handle),
        }
    }

    fn register_metrics() {
        describe_counter!(
            "gateway_events_received_total",
            Unit::Count,
            "Total dispatches received from the gateway"
        );
        describe_counter!(
            "gateway_identifies_total",
            Unit::Count,
            "Identifies acknowledged with READY"
        );
        describe_counter!(
            "gateway_resumes_total",
            Unit::Count,
            "Sessions resumed after reconnect"
        );
        describe_counter!(
            "gateway_reconnects_total",
            Unit::Count,
            "Shard reconnects by cause"
        );
        describe_counter!(
            "gateway_errors_total",
            Unit::Count,
            "Total gateway errors"
        );

        describe_histogram!(
            "gateway_heartbeat_latency_seconds",
            Unit::Seconds,
            "Heartbeat round-trip latency"
        );

        describe_gauge!(
            "gateway_shards_ready",
            Unit::Count,
            "Number of shards in ready state"
        );
    }

    /// Record a dispatch received
    pub fn record_event(&self, shard_id: u64, event_type: &str) {
        counter!(
            "gateway_events_received_total",
            "shard_id" => shard_id.to_string(),
            "event_type" => event_type.to_string()
        )
        .increment(1);
    }

    /// Record an identify acknowledged with READY
    pub fn record_identify(&self, shard_id: u64) {
        counter!(
            "gateway_identifies_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);
    }

    /// Record a successful resume
    pub fn record_resume(&self, shard_id: u64) {
        counter!(
            "gateway_resumes_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);
    }

    /// Record a reconnect with its cause
    pub fn record_reconnect(&self, shard_id: u64, cause: &'static str) {
        counter!(
            "gateway_reconnects_total",
            "shard_id" => shard_id.to_string(),
            "cause" => cause
        )
        .increment(1);
    }

    /// Record a gateway error
    pub fn record_error(&self, shard_id: u64, error_type: &'static str) {
        counter!(
            "gateway_errors_total",
            "shard_id" => shard_id.to_string(),
            "error_type" => error_type
        )
        .increment(1);
    }

    /// Record heartbeat round-trip latency
    pub fn record_heartbeat_latency(&self, shard_id: u64, ping_ms: u64) {
        histogram!(
            "gateway_heartbeat_latency_seconds",
            "shard_id" => shard_id.to_string()
        )
        .record(ping_ms as f64 / 1000.0);
    }

    /// Set shards ready count
    pub fn set_shards_ready(&self, count: usize) {
        gauge!("gateway_shards_ready").set(count as f64);
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
