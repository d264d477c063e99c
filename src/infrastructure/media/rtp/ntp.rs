//! NTP timestamps as carried in Sender Reports

use std::time::Duration;

/// Seconds between 1900-01-01 (NTP era 0) and 1970-01-01
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// 64-bit NTP timestamp
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    pub fn new(seconds: u32, fraction: u32) -> Self {
        Self { seconds, fraction }
    }

    /// Convert a wall-clock instant measured from the Unix epoch
    pub fn from_unix(now: Duration) -> Self {
        let seconds = (now.as_secs() + NTP_UNIX_OFFSET) as u32;
        let fraction = ((now.subsec_nanos() as u64) << 32) / 1_000_000_000;
        Self {
            seconds,
            fraction: fraction as u32,
        }
    }

    /// The middle 32 bits used for LSR and RTT arithmetic
    pub fn middle32(&self) -> u32 {
        ((self.seconds & 0xFFFF) << 16) | (self.fraction >> 16)
    }

    pub fn as_u64(&self) -> u64 {
        ((self.seconds as u64) << 32) | self.fraction as u64
    }
}

/// Express a duration in 1/65536 second units (the DLSR field)
pub fn to_short_units(elapsed: Duration) -> u32 {
    ((elapsed.as_secs_f64() * 65536.0) as u64).min(u32::MAX as u64) as u32
}

/// Convert 1/65536 second units back into a duration
pub fn from_short_units(units: u32) -> Duration {
    Duration::from_secs_f64(units as f64 / 65536.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_epoch_maps_to_ntp_offset() {
        let ntp = NtpTimestamp::from_unix(Duration::ZERO);
        assert_eq!(ntp.seconds as u64, NTP_UNIX_OFFSET);
        assert_eq!(ntp.fraction, 0);
    }

    #[test]
    fn test_half_second_fraction() {
        let ntp = NtpTimestamp::from_unix(Duration::from_millis(1500));
        assert_eq!(ntp.fraction, 0x8000_0000);
        assert_eq!(ntp.middle32() & 0xFFFF, 0x8000);
    }

    #[test]
    fn test_middle32_layout() {
        let ntp = NtpTimestamp::new(0x1234_5678, 0x9ABC_DEF0);
        assert_eq!(ntp.middle32(), 0x5678_9ABC);
        assert_eq!(ntp.as_u64(), 0x1234_5678_9ABC_DEF0);
    }

    #[test]
    fn test_short_units() {
        assert_eq!(to_short_units(Duration::from_secs(2)), 131072);
        assert_eq!(to_short_units(Duration::from_millis(500)), 32768);
        assert_eq!(from_short_units(98304), Duration::from_millis(1500));
    }
}
