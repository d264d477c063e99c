//! Jitter Buffer Implementation
//!
//! Holds received packets until their sequence number comes up, paced by the
//! nominal-delay timer, with an adaptive maximum delay recomputed on every
//! talkspurt timer tick.

use super::packet::RtpPacket;
use crate::infrastructure::media::timer::TimerHandle;
use serde::Serialize;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Gap beyond which a lower sequence number is read as a wrap, not a late packet
pub const WRAP_WINDOW: u16 = 50_000;

/// Jitter Buffer Configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitterBufferConfig {
    /// Maximum buffer size in packets
    pub max_packets: usize,
    /// Playout tick, the packetization interval of the session
    pub nominal_delay: Duration,
    /// Starting value of the adaptive maximum delay
    pub max_delay: Duration,
    /// Period of the maximum delay recomputation
    pub talkspurt_delay: Duration,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            max_packets: 100,
            nominal_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(10),
            talkspurt_delay: Duration::from_millis(10),
        }
    }
}

/// Smoothed transit delay and its variation, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DelayEstimator {
    pub packet_delay: f64,
    pub packet_variance: f64,
}

impl DelayEstimator {
    /// Weight when the packet beat the current maximum delay
    pub const SLOW: f64 = 0.9375;
    /// Weight when the packet was later than the current maximum delay
    pub const FAST: f64 = 0.75;
    /// Variance multiplier in the maximum delay
    pub const VARIANCE_FACTOR: f64 = 3.0;

    pub fn update(&mut self, transit_ms: f64, max_delay: Duration) {
        let max_delay_ms = max_delay.as_secs_f64() * 1000.0;
        let a = if transit_ms < max_delay_ms { Self::SLOW } else { Self::FAST };

        self.packet_delay = a * self.packet_delay + (1.0 - a) * transit_ms;
        self.packet_variance =
            a * self.packet_variance + (1.0 - a) * (self.packet_delay - transit_ms).abs();
    }

    /// `packetDelay + 3 * packetVariance`, never negative
    pub fn max_delay(&self) -> Duration {
        let ms = self.packet_delay + Self::VARIANCE_FACTOR * self.packet_variance;
        Duration::from_secs_f64(ms.max(0.0) / 1000.0)
    }
}

/// Buffered packet with arrival time
#[derive(Debug, Clone)]
pub struct BufferedPacket {
    pub packet: RtpPacket,
    pub source: SocketAddr,
    pub arrived: Duration,
    /// The application marked this packet as the end of a talkspurt
    pub end_of_spurt: bool,
}

/// Playout state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlayoutState {
    /// Waiting for the first packet of a talkspurt
    Empty,
    /// Timers started, nothing played yet
    Armed,
    /// Playing out
    Steady,
}

/// Result of handing a packet to the buffer
#[derive(Debug, Default)]
pub struct Insertion {
    /// Packet pushed out because the buffer was full
    pub released: Option<BufferedPacket>,
    /// First packet of a talkspurt: start the playout timers
    pub start_timers: bool,
    pub stored: bool,
}

/// Result of a nominal-delay tick
#[derive(Debug, Default)]
pub struct Playout {
    pub released: Option<BufferedPacket>,
    pub dropped: usize,
    /// The released packet ended the talkspurt: stop the timers
    pub talkspurt_over: bool,
}

/// Jitter Buffer Statistics
#[derive(Debug, Clone, Serialize)]
pub struct JitterBufferStats {
    pub buffered: usize,
    pub dropped: u64,
    pub max_consecutive_dropped: u32,
    pub late: u64,
    pub max_delay_ms: f64,
    pub state: PlayoutState,
}

/// `seq` is `pivot` or precedes it, allowing for one wrap
fn at_or_before(seq: u16, pivot: u16) -> bool {
    (seq <= pivot && pivot - seq < WRAP_WINDOW) || (pivot <= seq && seq - pivot > WRAP_WINDOW)
}

/// Jitter Buffer
pub struct JitterBuffer {
    config: JitterBufferConfig,
    packets: VecDeque<BufferedPacket>,
    expected_seq: u16,
    state: PlayoutState,
    max_delay: Duration,
    estimator: DelayEstimator,
    dropped: u64,
    max_consecutive_dropped: u32,
    late: u64,
    pub(crate) nominal_timer: Option<TimerHandle>,
    pub(crate) talkspurt_timer: Option<TimerHandle>,
}

impl JitterBuffer {
    pub fn new(config: JitterBufferConfig) -> Self {
        let max_packets = config.max_packets;
        let max_delay = config.max_delay;
        Self {
            config,
            packets: VecDeque::with_capacity(max_packets),
            expected_seq: 0,
            state: PlayoutState::Empty,
            max_delay,
            estimator: DelayEstimator::default(),
            dropped: 0,
            max_consecutive_dropped: 0,
            late: 0,
            nominal_timer: None,
            talkspurt_timer: None,
        }
    }

    pub fn config(&self) -> &JitterBufferConfig {
        &self.config
    }

    pub fn expected_seq(&self) -> u16 {
        self.expected_seq
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn estimator(&self) -> &DelayEstimator {
        &self.estimator
    }

    pub fn state(&self) -> PlayoutState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Feed the transit of an arriving packet into the delay estimate
    pub fn observe_transit(&mut self, arrival: Duration, timestamp_ms: u32) {
        let arrival_ms = arrival.as_millis() as u32;
        let transit = arrival_ms.wrapping_sub(timestamp_ms) as i32 as f64;
        self.estimator.update(transit, self.max_delay);
    }

    /// Add packet to buffer
    pub fn insert(&mut self, buffered: BufferedPacket) -> Insertion {
        let mut insertion = Insertion::default();
        let seq = buffered.packet.sequence;

        if self.state == PlayoutState::Empty {
            self.expected_seq = seq;
            self.state = PlayoutState::Armed;
            insertion.start_timers = true;
        }

        if self.packets.len() >= self.config.max_packets {
            if let Some(evicted) = self.take_lowest() {
                warn!(
                    "Jitter buffer full, releasing seq={} early",
                    evicted.packet.sequence
                );
                self.expected_seq = if evicted.end_of_spurt {
                    self.expected_seq.wrapping_add(1)
                } else {
                    evicted.packet.sequence.wrapping_add(1)
                };
                insertion.released = Some(evicted);
            }
        }

        let in_window = seq >= self.expected_seq || self.expected_seq - seq > WRAP_WINDOW;
        if !in_window {
            self.late += 1;
            debug!("Late packet seq={}, expected={}", seq, self.expected_seq);
        } else if self.packets.iter().any(|p| p.packet.sequence == seq) {
            debug!("Duplicate packet seq={} ignored", seq);
        } else {
            self.packets.push_back(buffered);
            insertion.stored = true;
            debug!(
                "Buffered packet seq={}, expected={}, buffer_size={}",
                seq,
                self.expected_seq,
                self.packets.len()
            );
        }

        insertion
    }

    /// Remove the buffered packet that comes first in playout order
    fn take_lowest(&mut self) -> Option<BufferedPacket> {
        let expected = self.expected_seq;
        let index = self
            .packets
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| p.packet.sequence.wrapping_sub(expected))
            .map(|(index, _)| index)?;
        self.packets.remove(index)
    }

    /// Nominal-delay tick: drop stale packets, then play out `expected_seq` if present
    pub fn on_nominal_timer(&mut self, now: Duration) -> Playout {
        let mut playout = Playout {
            dropped: self.drop_stale(now),
            ..Default::default()
        };

        let expected = self.expected_seq;
        if let Some(index) = self.packets.iter().position(|p| p.packet.sequence == expected) {
            let released = self.packets.remove(index);
            self.expected_seq = expected.wrapping_add(1);
            self.state = PlayoutState::Steady;

            if let Some(released) = released {
                if released.end_of_spurt {
                    playout.talkspurt_over = true;
                    self.state = PlayoutState::Empty;
                }
                playout.released = Some(released);
            }
        }

        playout
    }

    /// Drop the oldest packet and everything before it once it waited longer than `max_delay`
    fn drop_stale(&mut self, now: Duration) -> usize {
        let Some(oldest) = self.packets.front() else {
            return 0;
        };
        if oldest.end_of_spurt || now.saturating_sub(oldest.arrived) <= self.max_delay {
            return 0;
        }

        let pivot = oldest.packet.sequence;
        let before = self.packets.len();
        self.packets
            .retain(|p| !at_or_before(p.packet.sequence, pivot));
        let dropped = before - self.packets.len();

        self.dropped += dropped as u64;
        self.max_consecutive_dropped = self.max_consecutive_dropped.max(dropped as u32);
        self.expected_seq = pivot.wrapping_add(1);

        warn!(
            "Dropped {} packet(s) up to seq={} after exceeding max delay {:?}",
            dropped, pivot, self.max_delay
        );
        dropped
    }

    /// Talkspurt tick: recompute the adaptive maximum delay
    pub fn on_talkspurt_timer(&mut self) {
        self.max_delay = self.estimator.max_delay();
        debug!("Jitter buffer max delay now {:?}", self.max_delay);
    }

    /// Drop everything on session close. Timer handles are left for the caller to cancel.
    pub fn clear(&mut self) -> usize {
        let dropped = self.packets.len();
        self.packets.clear();
        self.dropped += dropped as u64;
        self.max_consecutive_dropped = self.max_consecutive_dropped.max(dropped as u32);
        self.state = PlayoutState::Empty;
        dropped
    }

    /// Get buffer statistics
    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            buffered: self.packets.len(),
            dropped: self.dropped,
            max_consecutive_dropped: self.max_consecutive_dropped,
            late: self.late,
            max_delay_ms: self.max_delay.as_secs_f64() * 1000.0,
            state: self.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn source() -> SocketAddr {
        "10.0.0.2:4000".parse().unwrap()
    }

    fn buffered(sequence: u16, arrived_ms: u64) -> BufferedPacket {
        BufferedPacket {
            packet: RtpPacket::new(0, sequence, arrived_ms as u32, 12345, Bytes::from(vec![0u8; 160])),
            source: source(),
            arrived: Duration::from_millis(arrived_ms),
            end_of_spurt: false,
        }
    }

    fn config(max_packets: usize, max_delay_ms: u64) -> JitterBufferConfig {
        JitterBufferConfig {
            max_packets,
            nominal_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(max_delay_ms),
            talkspurt_delay: Duration::from_millis(10),
        }
    }

    fn drain(buffer: &mut JitterBuffer, now: Duration) -> Vec<u16> {
        let mut out = Vec::new();
        while let Some(p) = buffer.on_nominal_timer(now).released {
            out.push(p.packet.sequence);
        }
        out
    }

    #[test]
    fn test_first_packet_arms_timers() {
        let mut buffer = JitterBuffer::new(config(10, 100));
        assert_eq!(buffer.state(), PlayoutState::Empty);

        let first = buffer.insert(buffered(100, 0));
        assert!(first.start_timers && first.stored);
        assert_eq!(buffer.expected_seq(), 100);
        assert_eq!(buffer.state(), PlayoutState::Armed);

        let second = buffer.insert(buffered(101, 5));
        assert!(!second.start_timers);
    }

    #[test]
    fn test_packet_reordering() {
        let mut buffer = JitterBuffer::new(config(10, 100));

        buffer.insert(buffered(100, 0));
        buffer.insert(buffered(102, 1));
        buffer.insert(buffered(101, 2));
        buffer.insert(buffered(103, 3));

        let played = drain(&mut buffer, Duration::from_millis(20));
        assert_eq!(played, vec![100, 101, 102, 103]);
        assert_eq!(buffer.state(), PlayoutState::Steady);
        assert_eq!(buffer.stats().dropped, 0);
    }

    #[test]
    fn test_missing_packet_holds_playout() {
        let mut buffer = JitterBuffer::new(config(10, 100));
        buffer.insert(buffered(100, 0));
        buffer.insert(buffered(102, 1));

        assert_eq!(drain(&mut buffer, Duration::from_millis(20)), vec![100]);
        assert_eq!(buffer.expected_seq(), 101);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_stale_packet_dropped_with_older_ones() {
        let mut buffer = JitterBuffer::new(config(10, 30));
        buffer.insert(buffered(100, 0));
        buffer.on_nominal_timer(Duration::from_millis(1));
        // 101 never arrives; 103 and 102 come in out of order
        buffer.insert(buffered(103, 10));
        buffer.insert(buffered(102, 20));
        buffer.insert(buffered(104, 25));

        // 103 is the oldest and has waited 40 ms > 30 ms; 104 plays on the same tick
        let playout = buffer.on_nominal_timer(Duration::from_millis(50));
        assert_eq!(playout.dropped, 2);
        assert_eq!(playout.released.map(|p| p.packet.sequence), Some(104));
        assert_eq!(buffer.expected_seq(), 105);

        let stats = buffer.stats();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.max_consecutive_dropped, 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_late_packet_not_inserted() {
        let mut buffer = JitterBuffer::new(config(10, 100));
        buffer.insert(buffered(100, 0));
        buffer.insert(buffered(101, 1));
        drain(&mut buffer, Duration::from_millis(5));

        let insertion = buffer.insert(buffered(100, 10));
        assert!(!insertion.stored);
        assert_eq!(buffer.stats().late, 1);
    }

    #[test]
    fn test_duplicate_not_buffered_twice() {
        let mut buffer = JitterBuffer::new(config(10, 100));
        buffer.insert(buffered(7, 0));
        assert!(!buffer.insert(buffered(7, 1)).stored);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_wrap_is_not_late() {
        let mut buffer = JitterBuffer::new(config(10, 100));
        buffer.insert(buffered(65534, 0));
        buffer.insert(buffered(65535, 1));
        assert!(buffer.insert(buffered(0, 2)).stored);
        assert!(buffer.insert(buffered(1, 3)).stored);

        let played = drain(&mut buffer, Duration::from_millis(10));
        assert_eq!(played, vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn test_full_buffer_releases_lowest() {
        let mut buffer = JitterBuffer::new(config(3, 100));
        buffer.insert(buffered(10, 0));
        buffer.insert(buffered(12, 1));
        buffer.insert(buffered(11, 2));

        let insertion = buffer.insert(buffered(13, 3));
        let released = insertion.released.expect("lowest packet released");
        assert_eq!(released.packet.sequence, 10);
        assert_eq!(buffer.expected_seq(), 11);
        assert!(insertion.stored);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_end_of_spurt_stops_playout() {
        let mut buffer = JitterBuffer::new(config(10, 100));
        buffer.insert(buffered(1, 0));
        let mut last = buffered(2, 1);
        last.end_of_spurt = true;
        buffer.insert(last);

        assert!(!buffer.on_nominal_timer(Duration::from_millis(5)).talkspurt_over);
        let playout = buffer.on_nominal_timer(Duration::from_millis(25));
        assert!(playout.talkspurt_over);
        assert_eq!(buffer.state(), PlayoutState::Empty);

        // Next talkspurt re-arms
        assert!(buffer.insert(buffered(50, 100)).start_timers);
        assert_eq!(buffer.expected_seq(), 50);
    }

    #[test]
    fn test_end_of_spurt_is_never_stale() {
        let mut buffer = JitterBuffer::new(config(10, 10));
        buffer.insert(buffered(1, 0));
        buffer.on_nominal_timer(Duration::from_millis(1));
        let mut marker = buffered(3, 0);
        marker.end_of_spurt = true;
        buffer.insert(marker);

        assert_eq!(buffer.on_nominal_timer(Duration::from_secs(1)).dropped, 0);
    }

    #[test]
    fn test_adaptive_delay_estimate() {
        let mut estimator = DelayEstimator::default();

        // Transit above the current max: fast weight
        estimator.update(40.0, Duration::from_millis(10));
        assert!((estimator.packet_delay - 10.0).abs() < 1e-9);
        assert!((estimator.packet_variance - 7.5).abs() < 1e-9);

        // Transit below: slow weight
        estimator.update(0.0, Duration::from_millis(50));
        assert!((estimator.packet_delay - 9.375).abs() < 1e-9);
        assert!((estimator.packet_variance - (0.9375 * 7.5 + 0.0625 * 9.375)).abs() < 1e-9);

        let expected = estimator.packet_delay + 3.0 * estimator.packet_variance;
        assert!((estimator.max_delay().as_secs_f64() * 1000.0 - expected).abs() < 1e-6);
    }

    #[test]
    fn test_talkspurt_recomputes_max_delay() {
        let mut buffer = JitterBuffer::new(config(10, 10));
        buffer.observe_transit(Duration::from_millis(1040), 1000);
        assert_eq!(buffer.max_delay(), Duration::from_millis(10));

        buffer.on_talkspurt_timer();
        let expected = buffer.estimator().max_delay();
        assert_eq!(buffer.max_delay(), expected);
        assert!(expected > Duration::from_millis(10));
    }

    #[test]
    fn test_clear_counts_drops() {
        let mut buffer = JitterBuffer::new(config(10, 100));
        for seq in 0..4 {
            buffer.insert(buffered(seq, 0));
        }
        assert_eq!(buffer.clear(), 4);

        let stats = buffer.stats();
        assert_eq!(stats.buffered, 0);
        assert_eq!(stats.dropped, 4);
        assert_eq!(stats.max_consecutive_dropped, 4);
        assert_eq!(stats.state, PlayoutState::Empty);
    }

    #[test]
    fn test_at_or_before() {
        assert!(at_or_before(5, 5));
        assert!(at_or_before(4, 5));
        assert!(!at_or_before(6, 5));
        assert!(at_or_before(65530, 3));
        assert!(!at_or_before(3, 65530));
    }
}
