//! RTP sequence number validation (RFC 3550 Appendix A.1)

/// Largest forward jump still treated as in-order
pub const MAX_DROPOUT: u16 = 3000;
/// Largest backward jump still treated as reordering
pub const MAX_MISORDER: u16 = 100;
/// Consecutive packets required before a new source is trusted
pub const MIN_SEQUENTIAL: u16 = 2;
/// Sequence number space
pub const SEQ_MOD: u32 = 1 << 16;

/// Outcome of validating one incoming sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// In order, or a tolerated jump
    Accepted,
    /// Sequence state was reinitialized around this packet
    AcceptedResync,
    /// Source is still establishing continuity; not counted
    Probationary,
    /// Duplicate or stale packet; nothing updated
    Discarded,
}

impl SequenceCheck {
    pub fn is_accepted(self) -> bool {
        matches!(self, SequenceCheck::Accepted | SequenceCheck::AcceptedResync)
    }
}

/// Per-source sequence bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceState {
    pub base_seq: u16,
    pub max_seq: u16,
    /// Wrap count, in units of `SEQ_MOD`
    pub cycles: u32,
    /// Candidate for a resync; `SEQ_MOD + 1` means none
    pub bad_seq: u32,
    /// Packets left before promotion; 0 when not on probation
    pub probation: u16,
    pub received: u32,
    pub expected_prior: u32,
    pub received_prior: u32,
    /// Set once the first RTP packet has been seen
    pub primed: bool,
}

impl SequenceState {
    /// Reset around `seq`
    pub fn init(&mut self, seq: u16) {
        self.base_seq = seq;
        self.max_seq = seq;
        self.bad_seq = SEQ_MOD + 1;
        self.cycles = 0;
        self.received = 0;
        self.received_prior = 0;
        self.expected_prior = 0;
    }

    /// Prepare for the first RTP packet of a source.
    ///
    /// An untrusted source goes on probation; a source already known from
    /// RTCP starts tracking at `seq` right away.
    pub fn prime(&mut self, seq: u16, probationary: bool) {
        self.primed = true;
        if probationary {
            self.init(seq);
            self.max_seq = seq.wrapping_sub(1);
            self.probation = MIN_SEQUENTIAL;
        } else {
            self.init(seq);
            self.probation = 0;
        }
    }

    /// Highest sequence number with the wrap count in the upper bits
    pub fn extended_max(&self) -> u32 {
        self.cycles.wrapping_add(self.max_seq as u32)
    }

    pub fn expected(&self) -> u32 {
        self.extended_max()
            .wrapping_sub(self.base_seq as u32)
            .wrapping_add(1)
    }

    /// Cumulative loss; negative when duplicates outnumber losses
    pub fn lost(&self) -> i64 {
        self.expected() as i64 - self.received as i64
    }

    /// Validate `seq` and update the state
    pub fn validate(&mut self, seq: u16) -> SequenceCheck {
        let delta = seq.wrapping_sub(self.max_seq);

        if self.probation > 0 {
            if seq == self.max_seq.wrapping_add(1) {
                self.probation -= 1;
                self.max_seq = seq;
                if self.probation == 0 {
                    self.init(seq);
                    self.received += 1;
                    return SequenceCheck::AcceptedResync;
                }
            } else {
                self.probation = MIN_SEQUENTIAL - 1;
                self.max_seq = seq;
            }
            return SequenceCheck::Probationary;
        }

        let outcome = if delta < MAX_DROPOUT {
            if seq < self.max_seq {
                self.cycles = self.cycles.wrapping_add(SEQ_MOD);
            }
            self.max_seq = seq;
            SequenceCheck::Accepted
        } else if delta as u32 <= SEQ_MOD - MAX_MISORDER as u32 {
            if seq as u32 == self.bad_seq {
                // Two sequential packets after a jump: the peer restarted
                self.init(seq);
                SequenceCheck::AcceptedResync
            } else {
                // An undetected loss is tolerated here rather than dropping the packet
                self.bad_seq = (seq as u32 + 1) & (SEQ_MOD - 1);
                SequenceCheck::Accepted
            }
        } else {
            return SequenceCheck::Discarded;
        };

        self.received += 1;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracking(seq: u16) -> SequenceState {
        let mut state = SequenceState::default();
        state.prime(seq, false);
        state
    }

    #[test]
    fn test_in_order_packets_all_accepted() {
        let mut state = tracking(100);
        for seq in 100..=104u16 {
            assert_eq!(state.validate(seq), SequenceCheck::Accepted);
        }
        assert_eq!(state.max_seq, 104);
        assert_eq!(state.cycles, 0);
        assert_eq!(state.received, 5);
        assert_eq!(state.lost(), 0);
    }

    #[test]
    fn test_forward_jumps_below_dropout() {
        for d in [1u16, 2, 50, 1000, 2999] {
            let mut state = tracking(10);
            state.validate(10);
            let next = 10u16.wrapping_add(d);
            assert_eq!(state.validate(next), SequenceCheck::Accepted, "delta {}", d);
            assert_eq!(state.max_seq, next);
            assert_eq!(state.cycles, 0);
        }
    }

    #[test]
    fn test_wraparound_counts_one_cycle() {
        let mut state = tracking(65534);
        assert_eq!(state.validate(65534), SequenceCheck::Accepted);
        assert_eq!(state.validate(65535), SequenceCheck::Accepted);
        assert_eq!(state.validate(0), SequenceCheck::Accepted);
        assert_eq!(state.validate(1), SequenceCheck::Accepted);

        assert_eq!(state.cycles, SEQ_MOD);
        assert_eq!(state.extended_max(), SEQ_MOD + 1);
        assert_eq!(state.expected(), 4);
    }

    #[test]
    fn test_probation_promotes_on_second_packet() {
        let mut state = SequenceState::default();
        state.prime(500, true);

        assert_eq!(state.validate(500), SequenceCheck::Probationary);
        assert_eq!(state.received, 0);

        assert_eq!(state.validate(501), SequenceCheck::AcceptedResync);
        assert_eq!(state.received, 1);
        assert_eq!(state.base_seq, 501);
        assert_eq!(state.max_seq, 501);
        assert_eq!(state.probation, 0);

        assert_eq!(state.validate(502), SequenceCheck::Accepted);
        assert_eq!(state.received, 2);
    }

    #[test]
    fn test_probation_restarts_on_gap() {
        let mut state = SequenceState::default();
        state.prime(10, true);

        assert_eq!(state.validate(10), SequenceCheck::Probationary);
        assert_eq!(state.validate(20), SequenceCheck::Probationary);
        assert_eq!(state.probation, MIN_SEQUENTIAL - 1);
        assert_eq!(state.max_seq, 20);

        assert_eq!(state.validate(21), SequenceCheck::AcceptedResync);
        assert_eq!(state.base_seq, 21);
    }

    #[test]
    fn test_large_jump_then_resync() {
        let mut state = tracking(100);
        state.validate(100);

        assert_eq!(state.validate(20000), SequenceCheck::Accepted);
        assert_eq!(state.bad_seq, 20001);
        assert_eq!(state.max_seq, 100);

        assert_eq!(state.validate(20001), SequenceCheck::AcceptedResync);
        assert_eq!(state.base_seq, 20001);
        assert_eq!(state.max_seq, 20001);
        assert_eq!(state.received, 1);
    }

    #[test]
    fn test_duplicate_and_stale_discarded() {
        let mut state = tracking(1000);
        for seq in 1000..=1010u16 {
            state.validate(seq);
        }
        let before = state.clone();

        // 50 behind max is within the misorder window
        assert_eq!(state.validate(960), SequenceCheck::Discarded);
        assert_eq!(state, before);
    }

    #[test]
    fn test_lost_counts_gaps() {
        let mut state = tracking(0);
        for seq in [0u16, 1, 2, 5, 6] {
            assert!(state.validate(seq).is_accepted());
        }
        assert_eq!(state.expected(), 7);
        assert_eq!(state.lost(), 2);
    }
}
