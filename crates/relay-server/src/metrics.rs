//! Prometheus metrics for the relay server.
//!
//! Connection lifecycle events are recorded as they happen; the hub's own
//! counters are copied over periodically by [`spawn_stats_reporter`].

use anyhow::Context;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::{CloseReason, Hub};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const DISCONNECTS_TOTAL: &str = "relay_disconnects_total";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const DELIVERIES_TOTAL: &str = "relay_deliveries_total";
    pub const DELIVERIES_DROPPED: &str = "relay_deliveries_dropped_total";
    pub const SLOW_CONSUMERS_TOTAL: &str = "relay_slow_consumers_disconnected_total";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Register metric descriptions with the installed recorder.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(names::CONNECTIONS_TOTAL, "WebSocket upgrades since start");
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Open WebSocket connections");
    metrics::describe_counter!(
        names::DISCONNECTS_TOTAL,
        "Connections terminated, by reason"
    );
    metrics::describe_counter!(
        names::MESSAGES_TOTAL,
        "Messages received from clients and dispatched by the hub"
    );
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Frames queued for delivery to connections"
    );
    metrics::describe_counter!(
        names::DELIVERIES_DROPPED,
        "Frames skipped because a connection's buffer was full"
    );
    metrics::describe_counter!(
        names::SLOW_CONSUMERS_TOTAL,
        "Connections closed because their buffer was full"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Errors, by type");
}

/// Install the Prometheus recorder and serve it on `addr`.
///
/// # Errors
///
/// Fails if a recorder is already installed or the listener cannot bind.
pub fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to install Prometheus exporter on {}", addr))?;

    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Record an upgraded connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record why a connection terminated.
pub fn record_close_reason(reason: CloseReason) {
    counter!(names::DISCONNECTS_TOTAL, "reason" => reason.as_str()).increment(1);
}

/// Record a failure that did not come from the hub, labelled by `kind`.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => kind).increment(1);
}

/// Copy the hub's counters into the metrics registry every `interval` until
/// the hub shuts down.
pub fn spawn_stats_reporter(hub: Arc<Hub>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = hub.wait_for_shutdown() => break,
                _ = ticker.tick() => {}
            }

            let stats = hub.stats();
            counter!(names::MESSAGES_TOTAL, "direction" => "inbound").absolute(stats.messages_received);
            counter!(names::MESSAGES_TOTAL, "direction" => "dispatched")
                .absolute(stats.messages_dispatched);
            counter!(names::DELIVERIES_TOTAL).absolute(stats.deliveries);
            counter!(names::DELIVERIES_DROPPED).absolute(stats.deliveries_dropped);
            counter!(names::SLOW_CONSUMERS_TOTAL).absolute(stats.slow_consumers_disconnected);
            counter!(names::ERRORS_TOTAL, "type" => "send").absolute(stats.send_failures);
        }
    })
}

/// Keeps the active-connections gauge in step with an upgraded socket.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
