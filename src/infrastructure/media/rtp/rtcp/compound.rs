//! Compound RTCP packets

use super::{RtcpError, RtcpHeader, RtcpPacket, RtcpPacketType, MAX_COMPOUND_SIZE};
use crate::infrastructure::media::rtp::wire::Reader;
use bytes::{Bytes, BytesMut};
use tracing::trace;

/// Sub-packets carried in one datagram, in wire order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompoundPacket {
    pub packets: Vec<RtcpPacket>,
}

impl CompoundPacket {
    /// Validate and decode a received datagram.
    ///
    /// The whole datagram is rejected when the first sub-packet is not SR or
    /// RR, a version is wrong, padding appears before the last sub-packet, or
    /// the declared lengths do not add up to the datagram length.
    pub fn decode(data: &[u8]) -> Result<Self, RtcpError> {
        let bounds = Self::validate(data)?;

        let mut packets = Vec::with_capacity(bounds.len());
        for (start, end) in bounds {
            match RtcpPacket::parse(&data[start..end])? {
                Some(packet) => packets.push(packet),
                None => trace!("Skipping RTCP sub-packet of type {}", data[start + 1]),
            }
        }

        Ok(Self { packets })
    }

    /// Header-only pass returning the byte range of each sub-packet
    fn validate(data: &[u8]) -> Result<Vec<(usize, usize)>, RtcpError> {
        if data.is_empty() {
            return Err(RtcpError::Empty);
        }

        let mut bounds = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            let header = RtcpHeader::parse(&mut Reader::new(&data[offset..]))?;

            if offset == 0
                && header.packet_type != RtcpPacketType::SR as u8
                && header.packet_type != RtcpPacketType::RR as u8
            {
                return Err(RtcpError::InvalidFirstPacket(header.packet_type));
            }

            let end = offset + header.packet_size();
            if end > data.len() {
                return Err(RtcpError::LengthMismatch {
                    declared: end,
                    actual: data.len(),
                });
            }
            if header.padding && end != data.len() {
                return Err(RtcpError::PaddingNotLast);
            }

            bounds.push((offset, end));
            offset = end;
        }

        Ok(bounds)
    }

    pub fn size(&self) -> usize {
        self.packets.iter().map(RtcpPacket::size).sum()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        for packet in &self.packets {
            packet.write_into(&mut buf);
        }
        buf.freeze()
    }
}

/// Accumulates outgoing sub-packets under a byte budget
#[derive(Debug)]
pub struct CompoundBuilder {
    packets: Vec<RtcpPacket>,
    used: usize,
    limit: usize,
}

impl CompoundBuilder {
    pub fn new() -> Self {
        Self::with_limit(MAX_COMPOUND_SIZE)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            packets: Vec::new(),
            used: 0,
            limit,
        }
    }

    /// Bytes still available
    pub fn remaining(&self) -> usize {
        self.limit - self.used
    }

    pub fn push(&mut self, packet: RtcpPacket) -> Result<(), RtcpError> {
        let size = packet.size();
        if size > self.remaining() {
            return Err(RtcpError::NoSpace { limit: self.limit });
        }
        self.used += size;
        self.packets.push(packet);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn finish(self) -> CompoundPacket {
        CompoundPacket {
            packets: self.packets,
        }
    }
}

impl Default for CompoundBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::media::rtp::ntp::NtpTimestamp;
    use crate::infrastructure::media::rtp::rtcp::{
        Goodbye, ReceiverReport, ReportBlock, SdesChunk, SdesItem, SdesItemType, SenderReport,
        SourceDescription,
    };

    fn sr_sdes_bye() -> CompoundPacket {
        let mut sr = SenderReport::new(1, NtpTimestamp::new(10, 20), 30, 40, 50);
        sr.add_report(ReportBlock {
            ssrc: 2,
            fraction_lost: 3,
            cumulative_lost: 4,
            highest_seq: 5,
            jitter: 6,
            lsr: 7,
            dlsr: 8,
        });
        let sdes = SourceDescription::with_chunk(
            SdesChunk::new(1).with_item(SdesItem::new(SdesItemType::Cname, "one@host")),
        );

        CompoundPacket {
            packets: vec![
                RtcpPacket::SenderReport(sr),
                RtcpPacket::SourceDescription(sdes),
                RtcpPacket::Goodbye(Goodbye::new(1)),
            ],
        }
    }

    #[test]
    fn test_accepts_sr_sdes_bye() {
        let compound = sr_sdes_bye();
        let data = compound.encode();
        assert_eq!(data.len(), compound.size());

        let decoded = CompoundPacket::decode(&data).unwrap();
        assert_eq!(decoded, compound);
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let mut data = sr_sdes_bye().encode().to_vec();
        // Claim one more word for the BYE than the datagram holds
        let bye_offset = data.len() - 8;
        data[bye_offset + 3] = 2;
        assert!(matches!(
            CompoundPacket::decode(&data),
            Err(RtcpError::LengthMismatch { .. })
        ));

        // Trailing garbage that does not form a header
        let mut data = sr_sdes_bye().encode().to_vec();
        data.extend_from_slice(&[0x80, 203]);
        assert!(CompoundPacket::decode(&data).is_err());
    }

    #[test]
    fn test_rejects_first_packet_type() {
        let data = RtcpPacket::Goodbye(Goodbye::new(1)).serialize();
        assert_eq!(
            CompoundPacket::decode(&data),
            Err(RtcpError::InvalidFirstPacket(203))
        );
    }

    #[test]
    fn test_rejects_padding_before_last() {
        let mut data = sr_sdes_bye().encode().to_vec();
        data[0] |= 0x20;
        assert_eq!(CompoundPacket::decode(&data), Err(RtcpError::PaddingNotLast));
    }

    #[test]
    fn test_accepts_padding_on_last() {
        let mut data = RtcpPacket::ReceiverReport(ReceiverReport::new(9)).serialize().to_vec();
        data.extend_from_slice(&RtcpPacket::Goodbye(Goodbye::new(9)).serialize());
        data.extend_from_slice(&[0, 0, 0, 4]);
        // BYE: set padding and grow its length by one word
        data[8] |= 0x20;
        data[11] = 2;

        let decoded = CompoundPacket::decode(&data).unwrap();
        assert_eq!(decoded.packets.len(), 2);
        assert_eq!(decoded.packets[1], RtcpPacket::Goodbye(Goodbye::new(9)));
    }

    #[test]
    fn test_rejects_bad_version_in_later_packet() {
        let mut data = sr_sdes_bye().encode().to_vec();
        let bye_offset = data.len() - 8;
        data[bye_offset] = 0x41;
        assert_eq!(CompoundPacket::decode(&data), Err(RtcpError::InvalidVersion(1)));
    }

    #[test]
    fn test_empty_datagram() {
        assert_eq!(CompoundPacket::decode(&[]), Err(RtcpError::Empty));
    }

    #[test]
    fn test_builder_budget() {
        let mut builder = CompoundBuilder::with_limit(20);
        builder
            .push(RtcpPacket::ReceiverReport(ReceiverReport::new(1)))
            .unwrap();
        assert_eq!(builder.remaining(), 12);

        let err = builder
            .push(RtcpPacket::SenderReport(SenderReport::new(1, NtpTimestamp::default(), 0, 0, 0)))
            .unwrap_err();
        assert_eq!(err, RtcpError::NoSpace { limit: 20 });

        builder.push(RtcpPacket::Goodbye(Goodbye::new(1))).unwrap();
        assert_eq!(builder.finish().packets.len(), 2);
    }
}
