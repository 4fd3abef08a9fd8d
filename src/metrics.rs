//! Prometheus metrics collection and exposition.
//!
//! - Connection counts (active, total)
//! - Handshake rejections
//! - Commands dispatched and dispatch faults

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

pub fn record_connection_opened() {
    counter!("mysqlwire_connections_total").increment(1);
    gauge!("mysqlwire_connections_active").increment(1.0);
}

pub fn record_connection_closed() {
    gauge!("mysqlwire_connections_active").decrement(1.0);
}

/// Record a handshake refused for bad credentials
pub fn record_handshake_rejected() {
    counter!("mysqlwire_handshakes_rejected_total").increment(1);
}

pub fn record_command() {
    counter!("mysqlwire_commands_total").increment(1);
}

/// Record a dispatch that panicked and cost its connection
pub fn record_command_fault() {
    counter!("mysqlwire_command_faults_total").increment(1);
}
