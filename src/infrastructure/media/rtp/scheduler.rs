//! RTCP transmission interval (RFC 3550 section 6.3 and Appendix A.7)

use rand::Rng;
use std::time::Duration;
use tracing::trace;

/// Minimum deterministic interval in seconds
pub const MIN_TIME: f64 = 5.0;
/// Share of the RTCP bandwidth reserved for senders
pub const SENDER_BW_FRACTION: f64 = 0.25;
/// Share of the RTCP bandwidth left to receivers
pub const RECEIVER_BW_FRACTION: f64 = 1.0 - SENDER_BW_FRACTION;
/// Offsets the downward bias of timer reconsideration (e - 3/2)
pub const COMPENSATION: f64 = std::f64::consts::E - 1.5;
/// UDP/IP overhead added to every RTCP packet size sample
pub const LOWER_LAYER_OVERHEAD: usize = 28;

/// Group state the interval depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub members: usize,
    pub senders: usize,
}

/// What a scheduler check decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    /// Not yet due
    Wait,
    /// Reconsideration pushed the send time out to `next`
    Reschedule { next: Duration },
    /// Emit a compound packet now
    Send,
}

/// Per-session RTCP timing state
#[derive(Debug, Clone)]
pub struct RtcpScheduler {
    /// RTCP bandwidth in bytes per second
    bandwidth: f64,
    /// Smoothed compound packet size including lower-layer overhead
    avg_rtcp_size: Option<f64>,
    pub we_sent: bool,
    pub initial: bool,
    pub sending_bye: bool,
    pub bye_count_received: usize,
    /// Contributing sources; always 0 here but part of the formula
    pub csrc_count: usize,
    pub last_send: Duration,
    pub next_send: Duration,
    pub prev_members: usize,
    /// Last deterministic interval in seconds
    interval: f64,
}

impl RtcpScheduler {
    pub fn new(bandwidth: f64) -> Self {
        Self {
            bandwidth,
            avg_rtcp_size: None,
            we_sent: false,
            initial: true,
            sending_bye: false,
            bye_count_received: 0,
            csrc_count: 0,
            last_send: Duration::ZERO,
            next_send: Duration::ZERO,
            prev_members: 1,
            interval: MIN_TIME,
        }
    }

    /// Seed the timer at session start
    pub fn start<R: Rng>(&mut self, now: Duration, membership: Membership, rng: &mut R) {
        self.last_send = now;
        self.prev_members = membership.members;
        self.next_send = now + self.compute_interval(membership, rng);
    }

    pub fn avg_rtcp_size(&self) -> Option<f64> {
        self.avg_rtcp_size
    }

    /// Fold a received compound packet into the size average
    pub fn record_packet_size(&mut self, len: usize) {
        let sample = (len + LOWER_LAYER_OVERHEAD) as f64;
        self.avg_rtcp_size = Some(match self.avg_rtcp_size {
            None => sample,
            Some(avg) => sample / 16.0 + avg * 15.0 / 16.0,
        });
    }

    /// Most recent deterministic interval
    pub fn current_interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }

    /// Deterministic interval in seconds, before randomization
    pub fn deterministic_interval(&self, membership: Membership) -> f64 {
        let min_time = if self.initial { MIN_TIME / 2.0 } else { MIN_TIME };

        let mut n = if self.sending_bye {
            self.bye_count_received
        } else {
            membership.members
        } as f64;
        let senders = membership.senders as f64;
        let mut bw = self.bandwidth;

        if senders > 0.0 && senders < n * SENDER_BW_FRACTION {
            if self.we_sent {
                bw *= SENDER_BW_FRACTION;
                n = senders;
            } else {
                bw *= RECEIVER_BW_FRACTION;
                n -= senders;
            }
        }

        let avg = self.avg_rtcp_size.unwrap_or(0.0);
        let interval = if bw > 0.0 { avg * n / bw } else { 0.0 };
        interval.max(min_time)
    }

    /// Randomized interval in [0.5, 1.5) times the deterministic one, compensated
    pub fn compute_interval<R: Rng>(&mut self, membership: Membership, rng: &mut R) -> Duration {
        self.interval = self.deterministic_interval(membership);
        let randomized = self.interval * (rng.gen::<f64>() + 0.5) / COMPENSATION;
        Duration::from_secs_f64(randomized)
    }

    fn divided(&self, interval: Duration) -> Duration {
        interval / (self.csrc_count as u32 + 1)
    }

    /// Periodic check. On `Send` the caller builds and transmits the compound
    /// packet, then calls [`RtcpScheduler::on_sent`]. `prev_members` only
    /// moves once a packet actually went out.
    pub fn check<R: Rng>(&mut self, now: Duration, membership: Membership, rng: &mut R) -> SendDecision {
        if now < self.next_send {
            return SendDecision::Wait;
        }

        let interval = self.compute_interval(membership, rng);
        let new_send = self.last_send + self.divided(interval);

        if now >= new_send {
            SendDecision::Send
        } else {
            trace!("RTCP send reconsidered to {:?}", new_send);
            self.next_send = new_send;
            SendDecision::Reschedule { next: new_send }
        }
    }

    /// Bookkeeping after a compound packet went out
    pub fn on_sent<R: Rng>(&mut self, now: Duration, membership: Membership, rng: &mut R) {
        self.initial = false;
        self.last_send = now;
        let interval = self.compute_interval(membership, rng);
        self.next_send = now + self.divided(interval);
        self.prev_members = membership.members;
    }

    /// Reverse reconsideration after the group shrank
    pub fn reverse_reconsider(&mut self, now: Duration, members: usize) -> bool {
        if members >= self.prev_members || self.prev_members == 0 {
            return false;
        }
        let factor = members as f64 / self.prev_members as f64;

        self.next_send = now + self.next_send.saturating_sub(now).mul_f64(factor);
        self.last_send = now.saturating_sub(now.saturating_sub(self.last_send).mul_f64(factor));
        self.prev_members = members;
        trace!("Reverse reconsideration by {:.3}, next send {:?}", factor, self.next_send);
        true
    }

    /// `we_sent` lapses after two intervals without RTP
    pub fn expire_we_sent(&mut self, now: Duration, last_rtp_send: Duration) {
        if self.we_sent && now.saturating_sub(last_rtp_send) >= self.current_interval() * 2 {
            self.we_sent = false;
        }
    }
}
