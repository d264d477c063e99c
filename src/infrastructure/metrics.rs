//! Prometheus metrics
//!
//! Recording goes through the `metrics` facade, so these calls are no-ops
//! until a recorder is installed.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;

/// Install the Prometheus exporter with an HTTP listener on `listen`
pub fn init_metrics(listen: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()?;

    describe_counter!("rtp_packets_sent_total", "RTP packets sent");
    describe_counter!("rtp_packets_received_total", "RTP packets accepted");
    describe_counter!("rtp_packets_invalid_total", "RTP packets that failed validation");
    describe_counter!(
        "rtp_probation_dropped_total",
        "RTP packets dropped while their source was on probation"
    );
    describe_counter!("rtcp_packets_sent_total", "RTCP sub-packets sent, by type");
    describe_counter!("rtcp_packets_received_total", "RTCP sub-packets received, by type");
    describe_counter!("rtcp_packets_invalid_total", "RTCP datagrams that failed validation");
    describe_counter!(
        "jitter_buffer_dropped_total",
        "Packets dropped by jitter buffers"
    );
    describe_gauge!("rtp_active_sessions", "Number of active RTP sessions");

    Ok(())
}

pub fn record_rtp_sent() {
    counter!("rtp_packets_sent_total").increment(1);
}

pub fn record_rtp_received() {
    counter!("rtp_packets_received_total").increment(1);
}

pub fn record_rtp_invalid() {
    counter!("rtp_packets_invalid_total").increment(1);
}

pub fn record_probation_drop() {
    counter!("rtp_probation_dropped_total").increment(1);
}

pub fn record_rtcp_sent(packet_type: &'static str) {
    counter!("rtcp_packets_sent_total", "type" => packet_type).increment(1);
}

pub fn record_rtcp_received(packet_type: &'static str) {
    counter!("rtcp_packets_received_total", "type" => packet_type).increment(1);
}

pub fn record_rtcp_invalid() {
    counter!("rtcp_packets_invalid_total").increment(1);
}

pub fn record_jitter_drops(count: usize) {
    counter!("jitter_buffer_dropped_total").increment(count as u64);
}

/// Update active sessions gauge
pub fn update_active_sessions(count: usize) {
    gauge!("rtp_active_sessions").set(count as f64);
}
