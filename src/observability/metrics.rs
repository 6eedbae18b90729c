//! Metrics collection and exposition.
//!
//! # Metrics
//! - `embednet_flows_total` (counter): inbound flows by transport and outcome
//!   (`intercepted`, `passed`, `dropped`)
//! - `embednet_handoff_dropped_total` (counter): flows dropped because no
//!   `accept` happened within the grace period or the listener closed
//! - `embednet_listeners_active` (gauge): registered listeners
//! - `embednet_gateway_connections_total` (counter): loopback gateway
//!   connections by protocol (`socks5`, `http`)
//! - `embednet_start_total` (counter): start attempts by outcome
//!
//! # Design Decisions
//! - The library only records; installing an exporter is the host's choice
//! - With no recorder installed every call is a no-op

use std::net::SocketAddr;

use crate::net::registry::Transport;

pub fn record_flow(transport: Transport, outcome: &'static str) {
    ::metrics::counter!(
        "embednet_flows_total",
        "transport" => transport.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_handoff_dropped(transport: Transport) {
    ::metrics::counter!("embednet_handoff_dropped_total", "transport" => transport.as_str())
        .increment(1);
}

pub fn record_listeners(count: usize) {
    ::metrics::gauge!("embednet_listeners_active").set(count as f64);
}

pub fn record_gateway_connection(protocol: &'static str) {
    ::metrics::counter!("embednet_gateway_connections_total", "protocol" => protocol)
        .increment(1);
}

pub fn record_start(outcome: &'static str) {
    ::metrics::counter!("embednet_start_total", "outcome" => outcome).increment(1);
}

/// Install the Prometheus exporter, serving scrapes on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}
