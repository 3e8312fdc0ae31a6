//! Little-endian binary reader and writer used by the manifest format.
//!
//! Strings are stored as a `u16` byte length followed by UTF-8 bytes, and arrays as a `u16` element count followed
//! by the elements.  An empty string is written as a zero length with no payload.
use std::convert::TryFrom;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("unexpected end of buffer: needed {needed} bytes at offset {offset}, {remaining} remaining")]
    UnexpectedEof {
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    #[error("invalid utf8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("{what} of length {len} does not fit a u16 length prefix")]
    TooLong { what: &'static str, len: usize },
    #[error("buffer would exceed its maximum size of {max} bytes")]
    Overflow { max: usize },
}

/// Sequential reader over a borrowed byte slice.
#[derive(Debug)]
pub struct BufferReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(data: &'a [u8]) -> BufferReader<'a> {
        BufferReader { data, offset: 0 }
    }

    /// A reader over an empty buffer can never produce a manifest.
    pub fn is_valid(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Resume reading at an offset previously returned by [BufferReader::offset].
    pub fn set_offset(&mut self, offset: usize) {
        assert!(offset <= self.data.len(), "offset past the end of the buffer");
        self.offset = offset;
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], BufferError> {
        if self.remaining() < needed {
            return Err(BufferError::UnexpectedEof {
                offset: self.offset,
                needed,
                remaining: self.remaining(),
            });
        }
        let out = &self.data[self.offset..self.offset + needed];
        self.offset += needed;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], BufferError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_bool(&mut self) -> Result<bool, BufferError> {
        Ok(self.read_u8()? == 1)
    }

    pub fn read_u8(&mut self) -> Result<u8, BufferError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, BufferError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, BufferError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, BufferError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, BufferError> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_utf8(&mut self) -> Result<String, BufferError> {
        let len = self.read_u16()? as usize;
        if len == 0 {
            return Ok(String::new());
        }
        let offset = self.offset;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| BufferError::InvalidUtf8 { offset })
    }

    /// Advance past a string without allocating it.
    pub fn skip_utf8(&mut self) -> Result<(), BufferError> {
        let len = self.read_u16()? as usize;
        self.take(len)?;
        Ok(())
    }

    pub fn read_i32_array(&mut self) -> Result<Vec<i32>, BufferError> {
        let count = self.read_u16()? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_i32()?);
        }
        Ok(out)
    }

    pub fn read_utf8_array(&mut self) -> Result<Vec<String>, BufferError> {
        let count = self.read_u16()? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_utf8()?);
        }
        Ok(out)
    }
}

/// Append-only writer with an upper bound on the total size.
#[derive(Debug)]
pub struct BufferWriter {
    data: Vec<u8>,
    max_size: usize,
}

impl BufferWriter {
    pub fn new(max_size: usize) -> BufferWriter {
        BufferWriter {
            data: Vec::new(),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        if self.data.len() + bytes.len() > self.max_size {
            return Err(BufferError::Overflow { max: self.max_size });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    fn put_len(&mut self, what: &'static str, len: usize) -> Result<(), BufferError> {
        let len = u16::try_from(len).map_err(|_| BufferError::TooLong { what, len })?;
        self.write_u16(len)
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), BufferError> {
        self.put(&[value as u8])
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), BufferError> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), BufferError> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), BufferError> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), BufferError> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_utf8(&mut self, value: &str) -> Result<(), BufferError> {
        self.put_len("string", value.len())?;
        self.put(value.as_bytes())
    }

    pub fn write_i32_array(&mut self, values: &[i32]) -> Result<(), BufferError> {
        self.put_len("int array", values.len())?;
        for v in values {
            self.write_i32(*v)?;
        }
        Ok(())
    }

    pub fn write_utf8_array(&mut self, values: &[String]) -> Result<(), BufferError> {
        self.put_len("string array", values.len())?;
        for v in values {
            self.write_utf8(v)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_what_was_written() {
        let mut w = BufferWriter::new(1024);
        w.write_u32(0x594F4F).unwrap();
        w.write_utf8("héllo").unwrap();
        w.write_utf8("").unwrap();
        w.write_bool(true).unwrap();
        w.write_i64(-5).unwrap();
        w.write_i32_array(&[1, -2, 3]).unwrap();
        w.write_utf8_array(&["a".into(), "bc".into()]).unwrap();
        let bytes = w.into_bytes();

        let mut r = BufferReader::new(&bytes);
        assert_eq!(r.read_u32().unwrap(), 0x594F4F);
        assert_eq!(r.read_utf8().unwrap(), "héllo");
        assert_eq!(r.read_utf8().unwrap(), "");
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_i64().unwrap(), -5);
        assert_eq!(r.read_i32_array().unwrap(), vec![1, -2, 3]);
        assert_eq!(r.read_utf8_array().unwrap(), vec!["a", "bc"]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_truncated_input() {
        let bytes = [5u8, 0, b'a', b'b'];
        let mut r = BufferReader::new(&bytes);
        assert_eq!(
            r.read_utf8(),
            Err(BufferError::UnexpectedEof {
                offset: 2,
                needed: 5,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_invalid_utf8() {
        let bytes = [2u8, 0, 0xff, 0xfe];
        let mut r = BufferReader::new(&bytes);
        assert_eq!(r.read_utf8(), Err(BufferError::InvalidUtf8 { offset: 2 }));
    }

    #[test]
    fn test_writer_limits() {
        let mut w = BufferWriter::new(4);
        w.write_u32(1).unwrap();
        assert_eq!(w.write_bool(true), Err(BufferError::Overflow { max: 4 }));

        let mut w = BufferWriter::new(usize::MAX);
        let long = "x".repeat(u16::MAX as usize + 1);
        assert!(matches!(
            w.write_utf8(&long),
            Err(BufferError::TooLong { what: "string", .. })
        ));
    }

    #[test]
    fn test_skip_utf8() {
        let mut w = BufferWriter::new(64);
        w.write_utf8("skipped").unwrap();
        w.write_utf8("kept").unwrap();
        let bytes = w.into_bytes();
        let mut r = BufferReader::new(&bytes);
        r.skip_utf8().unwrap();
        assert_eq!(r.read_utf8().unwrap(), "kept");
    }
}
