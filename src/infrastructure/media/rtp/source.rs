//! Source database: per-SSRC state owned by one session

use super::ntp::NtpTimestamp;
use super::rtcp::SdesItemType;
use super::sequence::SequenceState;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Copy of the last Sender Report heard from a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastSenderReport {
    pub ntp: NtpTimestamp,
    pub received_at: Duration,
}

/// State kept for one synchronization source
#[derive(Debug, Clone)]
pub struct SourceEntry {
    pub ssrc: u32,
    pub sequence: SequenceState,
    /// Interarrival jitter in 1/16 ms (RFC 3550 A.8 fixed point)
    pub jitter: u32,
    /// Previous transit time in ms
    pub transit: Option<i64>,
    pub jitter_sum: u64,
    pub jitter_samples: u32,
    pub last_active: Duration,
    pub is_sender: bool,
    /// Set when a BYE naming this source arrived
    pub bye_at: Option<Duration>,
    pub last_sr: Option<LastSenderReport>,
    pub sdes: HashMap<SdesItemType, String>,
    /// First heard through RTP, so it starts on probation
    probationary: bool,
}

impl SourceEntry {
    fn new(ssrc: u32, now: Duration, probationary: bool) -> Self {
        Self {
            ssrc,
            sequence: SequenceState::default(),
            jitter: 0,
            transit: None,
            jitter_sum: 0,
            jitter_samples: 0,
            last_active: now,
            is_sender: false,
            bye_at: None,
            last_sr: None,
            sdes: HashMap::new(),
            probationary,
        }
    }

    pub fn got_bye(&self) -> bool {
        self.bye_at.is_some()
    }

    /// Start sequence tracking on the first RTP packet
    pub fn prime_sequence(&mut self, seq: u16) {
        if !self.sequence.primed {
            self.sequence.prime(seq, self.probationary);
        }
    }

    /// Fold one packet into the jitter estimate.
    ///
    /// `arrival_ms` and `timestamp` are both millisecond clocks.
    pub fn update_jitter(&mut self, arrival_ms: u32, timestamp: u32) {
        let transit = arrival_ms.wrapping_sub(timestamp) as i32 as i64;
        if let Some(previous) = self.transit {
            let d = (transit - previous).abs();
            let jitter = self.jitter as i64 + d - ((self.jitter as i64 + 8) >> 4);
            self.jitter = jitter.clamp(0, u32::MAX as i64) as u32;
            self.jitter_sum += (self.jitter >> 4) as u64;
            self.jitter_samples += 1;
        }
        self.transit = Some(transit);
    }

    /// Jitter in milliseconds as carried in report blocks
    pub fn reported_jitter(&self) -> u32 {
        self.jitter >> 4
    }

    pub fn average_jitter_ms(&self) -> f64 {
        if self.jitter_samples == 0 {
            return 0.0;
        }
        self.jitter_sum as f64 / self.jitter_samples as f64
    }

    pub fn cname(&self) -> Option<&str> {
        self.sdes.get(&SdesItemType::Cname).map(String::as_str)
    }
}

/// What a housekeeping pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Housekeeping {
    pub removed: Vec<u32>,
    pub demoted: usize,
}

/// Sources known to a session, keyed by SSRC
#[derive(Debug, Clone)]
pub struct SourceDatabase {
    own_ssrc: u32,
    sources: HashMap<u32, SourceEntry>,
}

impl SourceDatabase {
    /// A BYE'd source lingers this long before removal
    pub const BYE_TIMEOUT: Duration = Duration::from_secs(2);
    /// Intervals of silence before a sender is demoted
    pub const SENDER_TIMEOUT_INTERVALS: u32 = 2;
    /// Intervals of silence before a source is removed
    pub const MEMBER_TIMEOUT_INTERVALS: u32 = 5;

    /// Create the database with the session's own entry
    pub fn new(own_ssrc: u32, now: Duration) -> Self {
        let mut sources = HashMap::new();
        sources.insert(own_ssrc, SourceEntry::new(own_ssrc, now, false));
        Self { own_ssrc, sources }
    }

    pub fn own_ssrc(&self) -> u32 {
        self.own_ssrc
    }

    /// Look up `ssrc`, creating it if unseen. Refreshes `last_active` either way.
    ///
    /// Returns the entry and whether it was created.
    pub fn get_or_create(
        &mut self,
        ssrc: u32,
        now: Duration,
        probationary: bool,
    ) -> (&mut SourceEntry, bool) {
        let mut created = false;
        let entry = self.sources.entry(ssrc).or_insert_with(|| {
            created = true;
            SourceEntry::new(ssrc, now, probationary)
        });
        entry.last_active = now;

        if created {
            debug!("Created source {:08x}", ssrc);
        }
        (entry, created)
    }

    pub fn get(&self, ssrc: u32) -> Option<&SourceEntry> {
        self.sources.get(&ssrc)
    }

    pub fn get_mut(&mut self, ssrc: u32) -> Option<&mut SourceEntry> {
        self.sources.get_mut(&ssrc)
    }

    pub fn own(&self) -> Option<&SourceEntry> {
        self.sources.get(&self.own_ssrc)
    }

    pub fn contains(&self, ssrc: u32) -> bool {
        self.sources.contains_key(&ssrc)
    }

    /// Remove a remote source. The own entry is never removed.
    pub fn remove(&mut self, ssrc: u32) -> Option<SourceEntry> {
        if ssrc == self.own_ssrc {
            return None;
        }
        let removed = self.sources.remove(&ssrc);
        if removed.is_some() {
            debug!("Removed source {:08x}, {} members left", ssrc, self.sources.len());
        }
        removed
    }

    /// Number of known sources, own entry included
    pub fn members(&self) -> usize {
        self.sources.len()
    }

    /// Remote sources flagged as senders in the current interval
    pub fn senders(&self) -> usize {
        self.sources.values().filter(|s| s.is_sender).count()
    }

    pub fn mark_sender(&mut self, ssrc: u32) {
        if let Some(entry) = self.sources.get_mut(&ssrc) {
            entry.is_sender = true;
        }
    }

    pub fn clear_senders(&mut self) {
        for entry in self.sources.values_mut() {
            entry.is_sender = false;
        }
    }

    /// Remote sources currently flagged as senders, ordered by SSRC
    pub fn sender_ssrcs(&self) -> Vec<u32> {
        let mut ssrcs: Vec<u32> = self
            .sources
            .values()
            .filter(|s| s.is_sender && s.ssrc != self.own_ssrc)
            .map(|s| s.ssrc)
            .collect();
        ssrcs.sort_unstable();
        ssrcs
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceEntry> {
        self.sources.values()
    }

    /// Expire BYE'd and silent sources and demote silent senders
    pub fn housekeep(&mut self, now: Duration, interval: Duration) -> Housekeeping {
        let sender_timeout = interval * Self::SENDER_TIMEOUT_INTERVALS;
        let member_timeout = interval * Self::MEMBER_TIMEOUT_INTERVALS;
        let mut result = Housekeeping::default();

        for entry in self.sources.values_mut() {
            if entry.ssrc == self.own_ssrc {
                continue;
            }
            let silent = now.saturating_sub(entry.last_active);

            if let Some(bye_at) = entry.bye_at {
                if now.saturating_sub(bye_at) > Self::BYE_TIMEOUT {
                    result.removed.push(entry.ssrc);
                }
                continue;
            }
            if silent > member_timeout {
                result.removed.push(entry.ssrc);
                continue;
            }
            if entry.is_sender && silent > sender_timeout {
                entry.is_sender = false;
                result.demoted += 1;
            }
        }

        result.removed.sort_unstable();
        for ssrc in &result.removed {
            self.sources.remove(ssrc);
            debug!("Source {:08x} timed out", ssrc);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWN: u32 = 0x1000;

    #[test]
    fn test_own_entry_exists() {
        let db = SourceDatabase::new(OWN, Duration::ZERO);
        assert_eq!(db.members(), 1);
        assert!(db.own().is_some());
        assert_eq!(db.senders(), 0);
    }

    #[test]
    fn test_get_or_create_refreshes_activity() {
        let mut db = SourceDatabase::new(OWN, Duration::ZERO);

        let (_, created) = db.get_or_create(7, Duration::from_secs(1), true);
        assert!(created);

        let (entry, created) = db.get_or_create(7, Duration::from_secs(3), true);
        assert!(!created);
        assert_eq!(entry.last_active, Duration::from_secs(3));
        assert_eq!(db.members(), 2);
    }

    #[test]
    fn test_own_entry_cannot_be_removed() {
        let mut db = SourceDatabase::new(OWN, Duration::ZERO);
        assert!(db.remove(OWN).is_none());
        assert_eq!(db.members(), 1);
    }

    #[test]
    fn test_probationary_sources_wait_for_second_packet() {
        let mut db = SourceDatabase::new(OWN, Duration::ZERO);

        let (rtp_source, _) = db.get_or_create(1, Duration::ZERO, true);
        rtp_source.prime_sequence(40);
        assert!(!rtp_source.sequence.validate(40).is_accepted());

        let (rtcp_source, _) = db.get_or_create(2, Duration::ZERO, false);
        rtcp_source.prime_sequence(40);
        assert!(rtcp_source.sequence.validate(40).is_accepted());
    }

    #[test]
    fn test_jitter_estimate() {
        let mut db = SourceDatabase::new(OWN, Duration::ZERO);
        let (entry, _) = db.get_or_create(9, Duration::ZERO, false);

        // Constant transit: no jitter
        entry.update_jitter(1000, 900);
        entry.update_jitter(1020, 920);
        assert_eq!(entry.jitter, 0);

        // Transit grows by 32 ms: jitter += 32 - 0
        entry.update_jitter(1072, 940);
        assert_eq!(entry.jitter, 32);
        assert_eq!(entry.reported_jitter(), 2);
        assert_eq!(entry.jitter_samples, 2);
    }

    #[test]
    fn test_sender_flags() {
        let mut db = SourceDatabase::new(OWN, Duration::ZERO);
        db.get_or_create(3, Duration::ZERO, false);
        db.get_or_create(2, Duration::ZERO, false);
        db.mark_sender(3);
        db.mark_sender(2);

        assert_eq!(db.senders(), 2);
        assert_eq!(db.sender_ssrcs(), vec![2, 3]);

        db.clear_senders();
        assert_eq!(db.senders(), 0);
    }

    #[test]
    fn test_housekeeping_timeouts() {
        let interval = Duration::from_secs(5);
        let mut db = SourceDatabase::new(OWN, Duration::ZERO);

        db.get_or_create(1, Duration::from_secs(0), false);
        db.get_or_create(2, Duration::from_secs(15), false);
        db.mark_sender(2);
        db.get_or_create(3, Duration::from_secs(29), false);
        db.get_mut(3).unwrap().bye_at = Some(Duration::from_secs(29));
        db.get_or_create(4, Duration::from_secs(29), false);
        db.get_mut(4).unwrap().bye_at = Some(Duration::from_secs(25));

        let result = db.housekeep(Duration::from_secs(30), interval);

        // 1: silent 30 s > 25 s; 4: BYE 5 s ago
        assert_eq!(result.removed, vec![1, 4]);
        // 2: silent 15 s > 10 s
        assert_eq!(result.demoted, 1);
        assert!(!db.get(2).unwrap().is_sender);
        assert!(db.contains(3));
        assert!(db.own().is_some());
    }
}
