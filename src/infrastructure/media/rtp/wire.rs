//! Bounds-checked big-endian cursor used by the RTP and RTCP decoders

use bytes::Buf;

/// Raised when a read would run past the end of the datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncated {
    pub needed: usize,
    pub remaining: usize,
}

/// Read-only cursor over a received datagram
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn ensure(&self, needed: usize) -> Result<(), Truncated> {
        if self.buf.remaining() < needed {
            return Err(Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, Truncated> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, Truncated> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self) -> Result<u32, Truncated> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    /// Borrow the next `len` bytes and advance past them
    pub fn take(&mut self, len: usize) -> Result<&'a [u8], Truncated> {
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), Truncated> {
        self.take(len).map(|_| ())
    }

    /// Everything not read yet
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_big_endian_fields() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let mut reader = Reader::new(&data);

        assert_eq!(reader.u8().unwrap(), 0x01);
        assert_eq!(reader.u16().unwrap(), 0x0203);
        assert_eq!(reader.u32().unwrap(), 0x04050607);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_truncation_reports_sizes() {
        let data = [0xAA, 0xBB];
        let mut reader = Reader::new(&data);

        let err = reader.u32().unwrap_err();
        assert_eq!(err, Truncated { needed: 4, remaining: 2 });
        // A failed read leaves the cursor untouched
        assert_eq!(reader.remaining(), 2);
    }

    #[test]
    fn test_take_and_rest() {
        let data = b"abcdef";
        let mut reader = Reader::new(data);

        assert_eq!(reader.take(2).unwrap(), b"ab");
        reader.skip(1).unwrap();
        assert_eq!(reader.rest(), b"def");
        assert!(reader.take(4).is_err());
    }
}
