//! The canonical wire format. All multi-byte integers are big-endian, and all
//! messages travel in frames of a 2-byte big-endian payload length followed by
//! that many payload bytes. The same format is used for records in the log
//! files, so a fetched record is already a valid frame payload.

use crate::errdata;
use crate::error::Result;

use std::io::{Read, Write};
use uuid::Uuid;

/// The maximum payload size of a single frame. The length prefix is a u16,
/// with the all-ones value reserved as invalid.
pub const MAX_FRAME: usize = 65534;

/// Reads a single frame, returning None on a clean EOF at a frame boundary.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len = [0; 2];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u16::from_be_bytes(len) as usize;
    if len > MAX_FRAME {
        return errdata!("invalid frame length {len}");
    }
    let mut payload = vec![0; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Writes a single frame. Payloads over MAX_FRAME are a protocol error.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME {
        return errdata!("frame payload of {} bytes exceeds {MAX_FRAME}", payload.len());
    }
    writer.write_all(&(payload.len() as u16).to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

/// Appends a u8 to the buffer.
pub fn put_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

/// Appends a big-endian u16 to the buffer.
pub fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Appends a big-endian u64 to the buffer.
pub fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Appends a 128-bit identifier to the buffer.
pub fn put_uuid(buf: &mut Vec<u8>, value: Uuid) {
    buf.extend_from_slice(value.as_bytes());
}

/// Appends a byte string with a 1-byte length prefix.
pub fn put_bytes8(buf: &mut Vec<u8>, value: &[u8]) {
    debug_assert!(value.len() <= u8::MAX as usize, "byte string too long");
    buf.push(value.len() as u8);
    buf.extend_from_slice(value);
}

/// Appends a byte string with a 2-byte length prefix.
pub fn put_bytes16(buf: &mut Vec<u8>, value: &[u8]) {
    debug_assert!(value.len() <= u16::MAX as usize, "byte string too long");
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
}

/// A cursor over an encoded payload, consuming fields front to back.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return errdata!("unexpected end of payload");
        }
        let (taken, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(taken)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().expect("split len")))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().expect("split len")))
    }

    pub fn uuid(&mut self) -> Result<Uuid> {
        Ok(Uuid::from_slice(self.take(16)?).expect("split len"))
    }

    /// Reads a byte string with a 1-byte length prefix.
    pub fn bytes8(&mut self) -> Result<&'a [u8]> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    /// Reads a byte string with a 2-byte length prefix.
    pub fn bytes16(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    /// Asserts that the payload has been fully consumed.
    pub fn done(&self) -> Result<()> {
        if !self.buf.is_empty() {
            return errdata!("{} trailing bytes in payload", self.buf.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() -> Result<()> {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"foo")?;
        write_frame(&mut buf, b"")?;
        let mut reader = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut reader)?, Some(b"foo".to_vec()));
        assert_eq!(read_frame(&mut reader)?, Some(Vec::new()));
        assert_eq!(read_frame(&mut reader)?, None);
        Ok(())
    }

    #[test]
    fn frame_max_payload() -> Result<()> {
        // A payload of exactly MAX_FRAME bytes encodes; one more is rejected.
        let mut buf = Vec::new();
        write_frame(&mut buf, &vec![0x01; MAX_FRAME])?;
        assert_eq!(read_frame(&mut std::io::Cursor::new(buf))?.map(|p| p.len()), Some(MAX_FRAME));

        assert!(write_frame(&mut Vec::new(), &vec![0x01; MAX_FRAME + 1]).is_err());

        // The all-ones length prefix is invalid on the read side too.
        let bad = vec![0xff, 0xff];
        assert!(read_frame(&mut std::io::Cursor::new(bad)).is_err());
        Ok(())
    }

    #[test]
    fn frame_truncated() {
        let buf = vec![0x00, 0x03, 0x01];
        assert!(read_frame(&mut std::io::Cursor::new(buf)).is_err());
    }

    #[test]
    fn primitives() -> Result<()> {
        let id = Uuid::from_u128(0xdeadbeef);
        let mut buf = Vec::new();
        put_u8(&mut buf, 7);
        put_u16(&mut buf, 515);
        put_u64(&mut buf, u64::MAX);
        put_uuid(&mut buf, id);
        put_bytes8(&mut buf, b"abc");
        put_bytes16(&mut buf, b"defg");

        let mut reader = Reader::new(&buf);
        assert_eq!(reader.u8()?, 7);
        assert_eq!(reader.u16()?, 515);
        assert_eq!(reader.u64()?, u64::MAX);
        assert_eq!(reader.uuid()?, id);
        assert_eq!(reader.bytes8()?, b"abc");
        assert_eq!(reader.bytes16()?, b"defg");
        reader.done()?;

        assert!(Reader::new(&buf[..3]).u64().is_err());
        Ok(())
    }
}
