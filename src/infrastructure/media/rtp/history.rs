//! Reception report history and round-trip time estimation

use super::ntp::NtpTimestamp;
use super::rtcp::ReportBlock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Latest report block one source sent about another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub block: ReportBlock,
    pub received_at: Duration,
}

/// Report blocks keyed by (reporter SSRC, reportee SSRC)
#[derive(Debug, Clone, Default)]
pub struct ReportHistory {
    entries: HashMap<(u32, u32), HistoryEntry>,
}

impl ReportHistory {
    /// Entries older than this many RTCP intervals are purged
    pub const TIMEOUT_INTERVALS: u32 = 3;

    pub fn new() -> Self {
        Self::default()
    }

    /// Store `block` as the newest report from `reporter`, replacing any older one
    pub fn insert(&mut self, reporter: u32, block: ReportBlock, now: Duration) {
        self.entries.insert(
            (reporter, block.ssrc),
            HistoryEntry {
                block,
                received_at: now,
            },
        );
    }

    pub fn get(&self, reporter: u32, reportee: u32) -> Option<&HistoryEntry> {
        self.entries.get(&(reporter, reportee))
    }

    /// Drop every entry reported by or about `ssrc`
    pub fn remove_source(&mut self, ssrc: u32) {
        self.entries
            .retain(|&(reporter, reportee), _| reporter != ssrc && reportee != ssrc);
    }

    /// Drop entries older than `TIMEOUT_INTERVALS` intervals; returns how many went
    pub fn purge(&mut self, now: Duration, interval: Duration) -> usize {
        let max_age = interval * Self::TIMEOUT_INTERVALS;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.received_at) <= max_age);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Round trip from a report block about ourselves, or `None` if the peer has
/// not seen one of our Sender Reports yet.
pub fn round_trip(block: &ReportBlock, now: NtpTimestamp) -> Option<Duration> {
    if block.lsr == 0 {
        return None;
    }
    let delay = now.middle32().wrapping_sub(block.lsr);
    let delay = if delay >= block.dlsr { delay - block.dlsr } else { 0 };
    Some(Duration::from_secs_f64(delay as f64 / 65536.0))
}

/// Running RTT statistics
#[derive(Debug, Clone, Serialize)]
pub struct RttStats {
    pub samples: u32,
    #[serde(with = "secs")]
    pub sum: Duration,
    #[serde(with = "secs")]
    pub min: Duration,
    #[serde(with = "secs")]
    pub max: Duration,
}

impl RttStats {
    /// Starting value of the minimum
    pub const INITIAL_MIN: Duration = Duration::from_millis(200);

    pub fn record(&mut self, rtt: Duration) {
        self.samples += 1;
        self.sum += rtt;
        self.max = self.max.max(rtt);
        self.min = self.min.min(rtt);
    }

    pub fn average(&self) -> Option<Duration> {
        (self.samples > 0).then(|| self.sum / self.samples)
    }
}

impl Default for RttStats {
    fn default() -> Self {
        Self {
            samples: 0,
            sum: Duration::ZERO,
            min: Self::INITIAL_MIN,
            max: Duration::ZERO,
        }
    }
}

pub(crate) mod secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
