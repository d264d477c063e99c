//! Goodbye (BYE)

use super::{pad_to_word, RtcpError, RtcpHeader, RtcpPacketType, HEADER_SIZE};
use crate::infrastructure::media::rtp::wire::Reader;
use bytes::{BufMut, BytesMut};

/// Goodbye (BYE)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goodbye {
    pub sources: Vec<u32>,
    pub reason: Option<String>,
}

impl Goodbye {
    pub fn new(ssrc: u32) -> Self {
        Self {
            sources: vec![ssrc],
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn reason_bytes(&self) -> Option<&[u8]> {
        self.reason
            .as_deref()
            .map(|reason| &reason.as_bytes()[..reason.len().min(255)])
    }

    pub(crate) fn parse_body(header: &RtcpHeader, reader: &mut Reader<'_>) -> Result<Self, RtcpError> {
        let sources = (0..header.count)
            .map(|_| reader.u32())
            .collect::<Result<Vec<_>, _>>()?;

        let reason = if reader.is_empty() {
            None
        } else {
            let len = reader.u8()? as usize;
            Some(String::from_utf8_lossy(reader.take(len)?).into_owned())
        };

        Ok(Self { sources, reason })
    }

    pub fn size(&self) -> usize {
        let reason = self
            .reason_bytes()
            .map(|text| 1 + text.len() + pad_to_word(1 + text.len()))
            .unwrap_or(0);
        HEADER_SIZE + 4 * self.sources.len() + reason
    }

    pub fn write_into(&self, buf: &mut BytesMut) {
        RtcpHeader::new(self.sources.len() as u8, RtcpPacketType::BYE, self.size()).write(buf);
        for ssrc in &self.sources {
            buf.put_u32(*ssrc);
        }
        if let Some(text) = self.reason_bytes() {
            buf.put_u8(text.len() as u8);
            buf.put_slice(text);
            buf.put_bytes(0, pad_to_word(1 + text.len()));
        }
    }
}
