//! Sender and Receiver Reports

use super::{RtcpError, RtcpHeader, RtcpPacketType, HEADER_SIZE, MAX_REPORT_BLOCKS};
use crate::infrastructure::media::rtp::ntp::NtpTimestamp;
use crate::infrastructure::media::rtp::wire::Reader;
use bytes::{BufMut, BytesMut};

/// Reception Report Block
///
/// ```text
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |                 SSRC_n (SSRC of the reportee)                 |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | fraction lost |       cumulative number of packets lost       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           extended highest sequence number received           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      interarrival jitter                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         last SR (LSR)                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                   delay since last SR (DLSR)                  |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24-bit field
    pub cumulative_lost: u32,
    pub highest_seq: u32,
    pub jitter: u32,
    /// Last SR timestamp
    pub lsr: u32,
    /// Delay since last SR, 1/65536 s
    pub dlsr: u32,
}

impl ReportBlock {
    pub const SIZE: usize = 24;

    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            ..Default::default()
        }
    }

    pub fn parse(reader: &mut Reader<'_>) -> Result<Self, RtcpError> {
        let ssrc = reader.u32()?;
        let lost = reader.u32()?;

        Ok(Self {
            ssrc,
            fraction_lost: (lost >> 24) as u8,
            cumulative_lost: lost & 0x00FF_FFFF,
            highest_seq: reader.u32()?,
            jitter: reader.u32()?,
            lsr: reader.u32()?,
            dlsr: reader.u32()?,
        })
    }

    pub fn write_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u32(((self.fraction_lost as u32) << 24) | (self.cumulative_lost & 0x00FF_FFFF));
        buf.put_u32(self.highest_seq);
        buf.put_u32(self.jitter);
        buf.put_u32(self.lsr);
        buf.put_u32(self.dlsr);
    }
}

fn parse_blocks(count: u8, reader: &mut Reader<'_>) -> Result<Vec<ReportBlock>, RtcpError> {
    (0..count).map(|_| ReportBlock::parse(reader)).collect()
}

/// Sender Report (SR)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp: NtpTimestamp,
    /// Sampling clock in milliseconds
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReportBlock>,
}

impl SenderReport {
    /// Header, SSRC and sender info
    pub const FIXED_SIZE: usize = 28;

    pub fn new(
        ssrc: u32,
        ntp: NtpTimestamp,
        rtp_timestamp: u32,
        packet_count: u32,
        octet_count: u32,
    ) -> Self {
        Self {
            ssrc,
            ntp,
            rtp_timestamp,
            packet_count,
            octet_count,
            reports: Vec::new(),
        }
    }

    /// Returns false once the packet already carries 31 blocks
    pub fn add_report(&mut self, report: ReportBlock) -> bool {
        if self.reports.len() < MAX_REPORT_BLOCKS {
            self.reports.push(report);
            return true;
        }
        false
    }

    pub(crate) fn parse_body(header: &RtcpHeader, reader: &mut Reader<'_>) -> Result<Self, RtcpError> {
        let ssrc = reader.u32()?;
        let ntp = NtpTimestamp::new(reader.u32()?, reader.u32()?);
        let rtp_timestamp = reader.u32()?;
        let packet_count = reader.u32()?;
        let octet_count = reader.u32()?;
        let reports = parse_blocks(header.count, reader)?;

        Ok(Self {
            ssrc,
            ntp,
            rtp_timestamp,
            packet_count,
            octet_count,
            reports,
        })
    }

    pub fn size(&self) -> usize {
        Self::FIXED_SIZE + self.reports.len().min(MAX_REPORT_BLOCKS) * ReportBlock::SIZE
    }

    pub fn write_into(&self, buf: &mut BytesMut) {
        let blocks = self.reports.len().min(MAX_REPORT_BLOCKS);
        RtcpHeader::new(blocks as u8, RtcpPacketType::SR, self.size()).write(buf);

        buf.put_u32(self.ssrc);
        buf.put_u32(self.ntp.seconds);
        buf.put_u32(self.ntp.fraction);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);

        for report in &self.reports[..blocks] {
            report.write_into(buf);
        }
    }
}

/// Receiver Report (RR)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReportBlock>,
}

impl ReceiverReport {
    /// Header and SSRC
    pub const FIXED_SIZE: usize = HEADER_SIZE + 4;

    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            reports: Vec::new(),
        }
    }

    pub fn add_report(&mut self, report: ReportBlock) -> bool {
        if self.reports.len() < MAX_REPORT_BLOCKS {
            self.reports.push(report);
            return true;
        }
        false
    }

    pub(crate) fn parse_body(header: &RtcpHeader, reader: &mut Reader<'_>) -> Result<Self, RtcpError> {
        let ssrc = reader.u32()?;
        let reports = parse_blocks(header.count, reader)?;
        Ok(Self { ssrc, reports })
    }

    pub fn size(&self) -> usize {
        Self::FIXED_SIZE + self.reports.len().min(MAX_REPORT_BLOCKS) * ReportBlock::SIZE
    }

    pub fn write_into(&self, buf: &mut BytesMut) {
        let blocks = self.reports.len().min(MAX_REPORT_BLOCKS);
        RtcpHeader::new(blocks as u8, RtcpPacketType::RR, self.size()).write(buf);

        buf.put_u32(self.ssrc);
        for report in &self.reports[..blocks] {
            report.write_into(buf);
        }
    }
}
