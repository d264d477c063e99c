//! RTCP (RTP Control Protocol) Implementation (RFC 3550)
//!
//! Every sub-packet starts with the common header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|  count  |      PT       |             length            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `length` counts 32-bit words minus one, header included.

pub mod bye;
pub mod compound;
pub mod report;
pub mod sdes;

pub use bye::Goodbye;
pub use compound::{CompoundBuilder, CompoundPacket};
pub use report::{ReceiverReport, ReportBlock, SenderReport};
pub use sdes::{SdesChunk, SdesItem, SdesItemType, SourceDescription};

use super::wire::{Reader, Truncated};
use bytes::{BufMut, Bytes, BytesMut};

pub const RTCP_VERSION: u8 = 2;
/// Common header size in bytes
pub const HEADER_SIZE: usize = 4;
/// The count field is 5 bits wide
pub const MAX_REPORT_BLOCKS: usize = 31;
/// Upper bound for an outgoing compound packet
pub const MAX_COMPOUND_SIZE: usize = 1500;

/// RTCP Packet Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtcpPacketType {
    /// Sender Report
    SR = 200,
    /// Receiver Report
    RR = 201,
    /// Source Description
    SDES = 202,
    /// Goodbye
    BYE = 203,
    /// Application Defined
    APP = 204,
}

impl RtcpPacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            200 => Some(Self::SR),
            201 => Some(Self::RR),
            202 => Some(Self::SDES),
            203 => Some(Self::BYE),
            204 => Some(Self::APP),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SR => "sr",
            Self::RR => "rr",
            Self::SDES => "sdes",
            Self::BYE => "bye",
            Self::APP => "app",
        }
    }
}

/// Decoded common header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    pub padding: bool,
    pub count: u8,
    pub packet_type: u8,
    /// Length in 32-bit words minus one
    pub length: u16,
}

impl RtcpHeader {
    pub fn new(count: u8, packet_type: RtcpPacketType, total_len: usize) -> Self {
        Self {
            padding: false,
            count: count & 0x1F,
            packet_type: packet_type as u8,
            length: (total_len / 4).saturating_sub(1) as u16,
        }
    }

    pub fn parse(reader: &mut Reader<'_>) -> Result<Self, RtcpError> {
        let byte0 = reader.u8()?;
        let version = byte0 >> 6;
        if version != RTCP_VERSION {
            return Err(RtcpError::InvalidVersion(version));
        }

        Ok(Self {
            padding: byte0 & 0x20 != 0,
            count: byte0 & 0x1F,
            packet_type: reader.u8()?,
            length: reader.u16()?,
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8((RTCP_VERSION << 6) | ((self.padding as u8) << 5) | (self.count & 0x1F));
        buf.put_u8(self.packet_type);
        buf.put_u16(self.length);
    }

    /// Size of the whole sub-packet in bytes, header included
    pub fn packet_size(&self) -> usize {
        (self.length as usize + 1) * 4
    }
}

/// RTCP Packet
#[derive(Debug, Clone, PartialEq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(SourceDescription),
    Goodbye(Goodbye),
}

impl RtcpPacket {
    /// Parse one sub-packet. `data` must hold exactly the bytes its header declares.
    ///
    /// Returns `Ok(None)` for APP and unknown packet types.
    pub fn parse(data: &[u8]) -> Result<Option<Self>, RtcpError> {
        let mut reader = Reader::new(data);
        let header = RtcpHeader::parse(&mut reader)?;

        let mut body = reader.rest();
        if header.padding {
            let pad = *body.last().ok_or(RtcpError::InvalidPadding)? as usize;
            if pad == 0 || pad > body.len() {
                return Err(RtcpError::InvalidPadding);
            }
            body = &body[..body.len() - pad];
        }
        let mut body = Reader::new(body);

        let packet = match RtcpPacketType::from_u8(header.packet_type) {
            Some(RtcpPacketType::SR) => {
                RtcpPacket::SenderReport(SenderReport::parse_body(&header, &mut body)?)
            }
            Some(RtcpPacketType::RR) => {
                RtcpPacket::ReceiverReport(ReceiverReport::parse_body(&header, &mut body)?)
            }
            Some(RtcpPacketType::SDES) => {
                RtcpPacket::SourceDescription(SourceDescription::parse_body(&header, &mut body)?)
            }
            Some(RtcpPacketType::BYE) => {
                RtcpPacket::Goodbye(Goodbye::parse_body(&header, &mut body)?)
            }
            Some(RtcpPacketType::APP) | None => return Ok(None),
        };

        Ok(Some(packet))
    }

    pub fn packet_type(&self) -> RtcpPacketType {
        match self {
            RtcpPacket::SenderReport(_) => RtcpPacketType::SR,
            RtcpPacket::ReceiverReport(_) => RtcpPacketType::RR,
            RtcpPacket::SourceDescription(_) => RtcpPacketType::SDES,
            RtcpPacket::Goodbye(_) => RtcpPacketType::BYE,
        }
    }

    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        match self {
            RtcpPacket::SenderReport(sr) => sr.size(),
            RtcpPacket::ReceiverReport(rr) => rr.size(),
            RtcpPacket::SourceDescription(sdes) => sdes.size(),
            RtcpPacket::Goodbye(bye) => bye.size(),
        }
    }

    pub fn write_into(&self, buf: &mut BytesMut) {
        match self {
            RtcpPacket::SenderReport(sr) => sr.write_into(buf),
            RtcpPacket::ReceiverReport(rr) => rr.write_into(buf),
            RtcpPacket::SourceDescription(sdes) => sdes.write_into(buf),
            RtcpPacket::Goodbye(bye) => bye.write_into(buf),
        }
    }

    /// Serialize RTCP packet to bytes
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        self.write_into(&mut buf);
        buf.freeze()
    }
}

/// Zero bytes needed to reach the next 32-bit boundary
pub(crate) fn pad_to_word(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// RTCP Errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RtcpError {
    #[error("Packet too short: needed {needed} bytes, {remaining} left")]
    PacketTooShort { needed: usize, remaining: usize },
    #[error("Invalid version: {0}")]
    InvalidVersion(u8),
    #[error("Empty compound packet")]
    Empty,
    #[error("Compound packet must start with SR or RR, got type {0}")]
    InvalidFirstPacket(u8),
    #[error("Padding bit set on a sub-packet that is not the last one")]
    PaddingNotLast,
    #[error("Invalid padding")]
    InvalidPadding,
    #[error("Declared lengths sum to {declared} bytes but the datagram has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Compound packet exceeds {limit} bytes")]
    NoSpace { limit: usize },
}

impl From<Truncated> for RtcpError {
    fn from(t: Truncated) -> Self {
        RtcpError::PacketTooShort {
            needed: t.needed,
            remaining: t.remaining,
        }
    }
}
