//! RTP Packet Implementation (RFC 3550)

use super::wire::{Reader, Truncated};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// RTP Packet Structure
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                     timestamp (milliseconds)                  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// ```
///
/// Outgoing packets never carry CSRCs or a header extension. Incoming CSRC
/// lists are skipped; an incoming extension is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// Marker bit
    pub marker: bool,
    /// Payload type
    pub payload_type: u8,
    /// Sequence number
    pub sequence: u16,
    /// Sampling time in milliseconds
    pub timestamp: u32,
    /// Synchronization source identifier
    pub ssrc: u32,
    /// Opaque payload
    pub payload: Bytes,
}

impl RtpPacket {
    pub const VERSION: u8 = 2;
    /// Fixed header size
    pub const HEADER_SIZE: usize = 12;

    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: Bytes) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload,
        }
    }

    /// Parse an RTP datagram
    pub fn parse(data: &[u8]) -> Result<Self, RtpError> {
        if data.len() < Self::HEADER_SIZE {
            return Err(RtpError::PacketTooShort);
        }

        let mut reader = Reader::new(data);

        // Byte 0: V(2), P(1), X(1), CC(4)
        let byte0 = reader.u8()?;
        let version = byte0 >> 6;
        let padding = byte0 & 0x20 != 0;
        let extension = byte0 & 0x10 != 0;
        let csrc_count = (byte0 & 0x0F) as usize;

        if version != Self::VERSION {
            return Err(RtpError::InvalidVersion(version));
        }
        if extension {
            return Err(RtpError::ExtensionUnsupported);
        }

        // Byte 1: M(1), PT(7)
        let byte1 = reader.u8()?;
        let marker = byte1 & 0x80 != 0;
        let payload_type = byte1 & 0x7F;

        let sequence = reader.u16()?;
        let timestamp = reader.u32()?;
        let ssrc = reader.u32()?;

        reader.skip(4 * csrc_count)?;

        let mut body = reader.rest();
        if padding {
            let pad = *body.last().ok_or(RtpError::InvalidPadding)? as usize;
            if pad == 0 || pad > body.len() {
                return Err(RtpError::InvalidPadding);
            }
            body = &body[..body.len() - pad];
        }

        Ok(Self {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload: Bytes::copy_from_slice(body),
        })
    }

    /// Session-level acceptance checks on a parsed packet
    ///
    /// Payload types 72..=76 collide with RTCP packet types 200..=204 once the
    /// marker bit is set and are never valid RTP.
    pub fn check_payload_type(&self, expected: u8) -> Result<(), RtpError> {
        if (72..=76).contains(&self.payload_type) || self.payload_type != expected {
            return Err(RtpError::InvalidPayloadType(self.payload_type));
        }
        Ok(())
    }

    /// Serialize RTP packet to bytes
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());

        buf.put_u8(Self::VERSION << 6);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.payload);

        buf.freeze()
    }

    /// Size on the wire
    pub fn size(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }

    pub fn set_marker(&mut self, marker: bool) {
        self.marker = marker;
    }
}

impl fmt::Display for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RTP[PT={}, Seq={}, TS={}, SSRC={:08x}, Marker={}, Payload={}]",
            self.payload_type,
            self.sequence,
            self.timestamp,
            self.ssrc,
            self.marker,
            self.payload.len()
        )
    }
}

/// RTP errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RtpError {
    #[error("Packet too short")]
    PacketTooShort,
    #[error("Invalid version: {0}")]
    InvalidVersion(u8),
    #[error("Invalid padding")]
    InvalidPadding,
    #[error("Invalid payload type: {0}")]
    InvalidPayloadType(u8),
    #[error("Header extensions are not supported")]
    ExtensionUnsupported,
}

impl From<Truncated> for RtpError {
    fn from(_: Truncated) -> Self {
        RtpError::PacketTooShort
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_packet_serialize_parse() {
        let payload = Bytes::from_static(b"Hello RTP");
        let packet = RtpPacket::new(0, 1234, 567890, 0x12345678, payload.clone());

        let data = packet.serialize();
        assert_eq!(data.len(), 12 + payload.len());
        assert_eq!(data[0], 0x80);

        let parsed = RtpPacket::parse(&data).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_rtp_packet_with_marker() {
        let mut packet = RtpPacket::new(8, 100, 1000, 0xAABBCCDD, Bytes::from_static(b"Test"));
        packet.set_marker(true);

        let data = packet.serialize();
        assert_eq!(data[1], 0x88);
        assert!(RtpPacket::parse(&data).unwrap().marker);
    }

    #[test]
    fn test_rtp_skips_csrc_list() {
        let mut data = vec![0x82, 0x00, 0x00, 0x01, 0, 0, 0, 10, 0, 0, 0, 7];
        data.extend_from_slice(&[0x11; 8]);
        data.extend_from_slice(b"xy");

        let parsed = RtpPacket::parse(&data).unwrap();
        assert_eq!(parsed.ssrc, 7);
        assert_eq!(&parsed.payload[..], b"xy");
    }

    #[test]
    fn test_rtp_csrc_list_longer_than_packet() {
        let data = vec![0x83, 0x00, 0x00, 0x01, 0, 0, 0, 10, 0, 0, 0, 7, 0, 0, 0, 1];
        assert_eq!(RtpPacket::parse(&data), Err(RtpError::PacketTooShort));
    }

    #[test]
    fn test_rtp_padding_is_stripped() {
        let mut data = RtpPacket::new(0, 1, 2, 3, Bytes::from_static(b"abcd")).serialize().to_vec();
        data[0] |= 0x20;
        data.extend_from_slice(&[0, 0, 3]);

        let parsed = RtpPacket::parse(&data).unwrap();
        assert_eq!(&parsed.payload[..], b"abcd");
    }

    #[test]
    fn test_rtp_bad_padding_count() {
        let mut data = RtpPacket::new(0, 1, 2, 3, Bytes::from_static(b"ab")).serialize().to_vec();
        data[0] |= 0x20;
        data.push(9);
        assert_eq!(RtpPacket::parse(&data), Err(RtpError::InvalidPadding));
    }

    #[test]
    fn test_rtp_extension_rejected() {
        let mut data = vec![0u8; 16];
        data[0] = 0x90;
        assert_eq!(RtpPacket::parse(&data), Err(RtpError::ExtensionUnsupported));
    }

    #[test]
    fn test_rtp_min_size() {
        let data = vec![0u8; 11];
        assert_eq!(RtpPacket::parse(&data), Err(RtpError::PacketTooShort));
    }

    #[test]
    fn test_rtp_invalid_version() {
        let mut data = vec![0u8; 12];
        data[0] = 0x40;
        assert_eq!(RtpPacket::parse(&data), Err(RtpError::InvalidVersion(1)));
    }

    #[test]
    fn test_payload_type_checks() {
        let packet = RtpPacket::new(0, 1, 2, 3, Bytes::new());
        assert!(packet.check_payload_type(0).is_ok());
        assert_eq!(packet.check_payload_type(8), Err(RtpError::InvalidPayloadType(0)));

        let rtcp_like = RtpPacket::new(72, 1, 2, 3, Bytes::new());
        assert!(rtcp_like.check_payload_type(72).is_err());
    }
}
