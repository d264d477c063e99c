//! Session statistics

use super::history::RttStats;
use super::jitter_buffer::JitterBufferStats;
use super::rtcp::RtcpPacketType;
use serde::Serialize;

/// RTP packet counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RtpCounters {
    pub packets_sent: u32,
    /// Header included
    pub bytes_sent: u32,
    pub packets_received: u32,
    pub bytes_received: u32,
    pub packets_delivered: u64,
    pub invalid: u64,
    pub probation_dropped: u64,
    pub discarded: u64,
    /// Sum of delivery time minus sender timestamp, in ms
    pub total_e2e_delay_ms: u64,
}

/// RTCP counters by sub-packet type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RtcpCounters {
    pub sr_sent: u64,
    pub rr_sent: u64,
    pub sdes_sent: u64,
    pub bye_sent: u64,
    pub sr_received: u64,
    pub rr_received: u64,
    pub sdes_received: u64,
    pub bye_received: u64,
    pub compound_sent: u64,
    pub compound_received: u64,
    pub invalid: u64,
}

impl RtcpCounters {
    pub fn count_sent(&mut self, packet_type: RtcpPacketType) {
        match packet_type {
            RtcpPacketType::SR => self.sr_sent += 1,
            RtcpPacketType::RR => self.rr_sent += 1,
            RtcpPacketType::SDES => self.sdes_sent += 1,
            RtcpPacketType::BYE => self.bye_sent += 1,
            RtcpPacketType::APP => {}
        }
    }

    pub fn count_received(&mut self, packet_type: RtcpPacketType) {
        match packet_type {
            RtcpPacketType::SR => self.sr_received += 1,
            RtcpPacketType::RR => self.rr_received += 1,
            RtcpPacketType::SDES => self.sdes_received += 1,
            RtcpPacketType::BYE => self.bye_received += 1,
            RtcpPacketType::APP => {}
        }
    }
}

/// Point-in-time snapshot of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub own_ssrc: u32,
    pub remote_ssrc: Option<u32>,
    pub active: bool,
    pub members: usize,
    pub senders: usize,
    pub rtp: RtpCounters,
    pub rtcp: RtcpCounters,
    pub average_e2e_delay_ms: f64,
    /// Mean of the remote source's jitter samples
    pub average_jitter_ms: f64,
    pub rtt: RttStats,
    pub average_rtt_ms: Option<f64>,
    pub avg_rtcp_size: Option<f64>,
    pub rtcp_interval_secs: f64,
    pub jitter_buffer: Option<JitterBufferStats>,
}

impl SessionStats {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
