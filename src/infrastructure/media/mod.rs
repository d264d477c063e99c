//! Media transport implementations

pub mod rtp;
pub mod timer;
pub mod transport;

pub use rtp::{
    CompoundPacket, JitterBuffer, JitterBufferConfig, JitterBufferStats, Reception, RtcpError,
    RtcpPacket, RtpError, RtpPacket, Session, SessionKey, SessionStats, SessionTable,
};
pub use timer::{FiredTimer, SharedTimerQueue, TimerHandle, TimerKind, TimerQueue, TimerService};
pub use transport::{
    ChannelSender, ChannelSink, DatagramSender, Delivery, OutboundDatagram, PayloadSink,
};
