//! RTP (Real-time Transport Protocol) Implementation
//!
//! This module implements RTP and RTCP according to RFC 3550.

pub mod history;
pub mod jitter_buffer;
pub mod ntp;
pub mod packet;
pub mod reporter;
pub mod rtcp;
pub mod scheduler;
pub mod sequence;
pub mod session;
pub mod source;
pub mod stats;
pub mod table;
pub mod wire;

pub use history::{ReportHistory, RttStats};
pub use jitter_buffer::{JitterBuffer, JitterBufferConfig, JitterBufferStats, PlayoutState};
pub use ntp::NtpTimestamp;
pub use packet::{RtpError, RtpPacket};
pub use rtcp::{
    CompoundBuilder, CompoundPacket, Goodbye, ReceiverReport, ReportBlock, RtcpError, RtcpPacket,
    SdesChunk, SdesItem, SdesItemType, SenderReport, SourceDescription,
};
pub use scheduler::{Membership, RtcpScheduler, SendDecision};
pub use sequence::{SequenceCheck, SequenceState};
pub use session::{Collaborators, Reception, Session, SessionOptions, SessionParams};
pub use source::{SourceDatabase, SourceEntry};
pub use stats::{RtcpCounters, RtpCounters, SessionStats};
pub use table::{SessionKey, SessionTable};
