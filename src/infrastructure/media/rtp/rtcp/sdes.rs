//! Source Description (SDES)

use super::{pad_to_word, RtcpError, RtcpHeader, RtcpPacketType, HEADER_SIZE};
use crate::infrastructure::media::rtp::wire::Reader;
use bytes::{BufMut, BytesMut};

/// SDES item type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SdesItemType {
    End = 0,
    Cname = 1,
    Name = 2,
    Email = 3,
    Phone = 4,
    Loc = 5,
    Tool = 6,
    Note = 7,
    Priv = 8,
}

impl SdesItemType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::End),
            1 => Some(Self::Cname),
            2 => Some(Self::Name),
            3 => Some(Self::Email),
            4 => Some(Self::Phone),
            5 => Some(Self::Loc),
            6 => Some(Self::Tool),
            7 => Some(Self::Note),
            8 => Some(Self::Priv),
            _ => None,
        }
    }
}

/// One `{type, length, text}` item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesItem {
    pub kind: SdesItemType,
    pub text: String,
}

impl SdesItem {
    /// Longest text an 8-bit length field can carry
    pub const MAX_TEXT: usize = 255;

    pub fn new(kind: SdesItemType, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    fn encoded_text(&self) -> &[u8] {
        let bytes = self.text.as_bytes();
        &bytes[..bytes.len().min(Self::MAX_TEXT)]
    }

    /// Encoded size including the type and length octets
    pub fn size(&self) -> usize {
        2 + self.encoded_text().len()
    }
}

/// The items describing one SSRC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub items: Vec<SdesItem>,
}

impl SdesChunk {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            items: Vec::new(),
        }
    }

    pub fn with_item(mut self, item: SdesItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn item(&self, kind: SdesItemType) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.kind == kind)
            .map(|item| item.text.as_str())
    }

    fn items_size(&self) -> usize {
        self.items.iter().map(SdesItem::size).sum()
    }

    /// SSRC, items, and at least one terminating null octet, word aligned
    pub fn size(&self) -> usize {
        let items = self.items_size();
        4 + items + (4 - items % 4)
    }

    fn parse(reader: &mut Reader<'_>) -> Result<Self, RtcpError> {
        let ssrc = reader.u32()?;
        let mut items = Vec::new();
        let mut consumed = 0;

        loop {
            let kind = reader.u8()?;
            consumed += 1;
            if kind == SdesItemType::End as u8 {
                reader.skip(pad_to_word(consumed))?;
                break;
            }

            let len = reader.u8()? as usize;
            let text = reader.take(len)?;
            consumed += 1 + len;

            // Unknown item types are skipped
            if let Some(kind) = SdesItemType::from_u8(kind) {
                items.push(SdesItem::new(kind, String::from_utf8_lossy(text)));
            }
        }

        Ok(Self { ssrc, items })
    }

    fn write_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        for item in &self.items {
            let text = item.encoded_text();
            buf.put_u8(item.kind as u8);
            buf.put_u8(text.len() as u8);
            buf.put_slice(text);
        }
        let items = self.items_size();
        buf.put_bytes(0, 4 - items % 4);
    }
}

/// Source Description (SDES)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceDescription {
    pub chunks: Vec<SdesChunk>,
}

impl SourceDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk(chunk: SdesChunk) -> Self {
        Self {
            chunks: vec![chunk],
        }
    }

    pub(crate) fn parse_body(header: &RtcpHeader, reader: &mut Reader<'_>) -> Result<Self, RtcpError> {
        let chunks = (0..header.count)
            .map(|_| SdesChunk::parse(reader))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { chunks })
    }

    pub fn size(&self) -> usize {
        HEADER_SIZE + self.chunks.iter().map(SdesChunk::size).sum::<usize>()
    }

    pub fn write_into(&self, buf: &mut BytesMut) {
        RtcpHeader::new(self.chunks.len() as u8, RtcpPacketType::SDES, self.size()).write(buf);
        for chunk in &self.chunks {
            chunk.write_into(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::media::rtp::rtcp::RtcpPacket;

    #[test]
    fn test_cname_chunk_layout() {
        let chunk = SdesChunk::new(0x01020304).with_item(SdesItem::new(SdesItemType::Cname, "ab"));
        // 2 + 2 item bytes, then a full null word
        assert_eq!(chunk.size(), 4 + 4 + 4);

        let sdes = SourceDescription::with_chunk(chunk);
        let data = RtcpPacket::SourceDescription(sdes).serialize();
        assert_eq!(data.len(), 16);
        assert_eq!(&data[..4], &[0x81, 202, 0, 3]);
        assert_eq!(&data[8..12], &[1, 2, b'a', b'b']);
        assert_eq!(&data[12..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_sdes_multiple_items() {
        let chunk = SdesChunk::new(42)
            .with_item(SdesItem::new(SdesItemType::Cname, "alice@10.0.0.1"))
            .with_item(SdesItem::new(SdesItemType::Name, "Alice"))
            .with_item(SdesItem::new(SdesItemType::Note, "on a call"));
        let sdes = SourceDescription::with_chunk(chunk.clone());

        let data = RtcpPacket::SourceDescription(sdes).serialize();
        assert_eq!(data.len() % 4, 0);

        match RtcpPacket::parse(&data).unwrap() {
            Some(RtcpPacket::SourceDescription(parsed)) => {
                assert_eq!(parsed.chunks, vec![chunk]);
                assert_eq!(parsed.chunks[0].item(SdesItemType::Name), Some("Alice"));
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_unknown_item_skipped() {
        // SSRC 9, item type 42 with 1 byte, CNAME "x", END + pad
        let data = [
            0x81, 202, 0, 3, 0, 0, 0, 9, 42, 1, b'z', 1, 1, b'x', 0, 0,
        ];
        match RtcpPacket::parse(&data).unwrap() {
            Some(RtcpPacket::SourceDescription(parsed)) => {
                assert_eq!(parsed.chunks[0].items.len(), 1);
                assert_eq!(parsed.chunks[0].item(SdesItemType::Cname), Some("x"));
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_item_text_is_capped() {
        let item = SdesItem::new(SdesItemType::Note, "n".repeat(300));
        assert_eq!(item.size(), 2 + 255);
    }

    #[test]
    fn test_missing_terminator() {
        let data = [0x81, 202, 0, 2, 0, 0, 0, 9, 1, 2, b'a', b'b'];
        assert!(matches!(
            RtcpPacket::parse(&data),
            Err(RtcpError::PacketTooShort { .. })
        ));
    }
}
