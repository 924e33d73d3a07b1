//! Little-endian byte codec shared by wire envelopes, durable records and log events.
//!
//! Integers are fixed-width little-endian. Byte strings and UTF-8 strings carry
//! a `u32` length prefix. Booleans are a single `0`/`1` byte.

use crate::{Error, Result};

/// Upper bound on a single length-prefixed field.
pub const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

/// Append-only encoder.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a byte.
    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Writes a boolean.
    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    /// Writes a `u32`.
    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes an `i32`.
    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a `u64`.
    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes an `i64`.
    pub fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a length-prefixed byte string.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn put_string(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    /// Writes a length-prefixed list of `i64`.
    pub fn put_i64_list(&mut self, values: &[i64]) {
        self.put_u32(values.len() as u32);
        for value in values {
            self.put_i64(*value);
        }
    }

    /// Returns the encoded bytes.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-based decoder.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Starts reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or_else(|| Error::InvalidFrame("length overflow".into()))?;
        if end > self.data.len() {
            return Err(Error::InsufficientData(end));
        }
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    /// Reads a byte.
    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a boolean.
    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::InvalidFrame(format!("invalid boolean byte {}", other))),
        }
    }

    /// Reads a `u32`.
    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads an `i32`.
    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    /// Reads a `u64`.
    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Reads an `i64`.
    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    /// Reads a length-prefixed byte string.
    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        if len > MAX_FIELD_LEN {
            return Err(Error::InvalidFrame(format!("field too long: {} bytes", len)));
        }
        Ok(self.take(len)?.to_vec())
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn get_string(&mut self) -> Result<String> {
        String::from_utf8(self.get_bytes()?)
            .map_err(|_| Error::InvalidFrame("string is not valid UTF-8".into()))
    }

    /// Reads a length-prefixed list of `i64`.
    pub fn get_i64_list(&mut self) -> Result<Vec<i64>> {
        let count = self.get_u32()? as usize;
        if count > self.remaining() / 8 {
            return Err(Error::InsufficientData(self.offset + count * 8));
        }
        (0..count).map(|_| self.get_i64()).collect()
    }

    /// Fails if unread bytes remain.
    pub fn finish(self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::InvalidFrame(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_little_endian() {
        let mut w = Writer::new();
        w.put_u32(0x0403_0201);
        w.put_i64(-2);
        let bytes = w.finish();

        assert_eq!(&bytes[..4], &[0x01, 0x02, 0x03, 0x04]);
        let mut r = Reader::new(&bytes);
        assert_eq!(r.get_u32().unwrap(), 0x0403_0201);
        assert_eq!(r.get_i64().unwrap(), -2);
        r.finish().unwrap();
    }

    #[test]
    fn test_truncated_input() {
        let mut w = Writer::new();
        w.put_bytes(b"abcdef");
        let bytes = w.finish();

        let mut r = Reader::new(&bytes[..7]);
        assert!(matches!(r.get_bytes(), Err(Error::InsufficientData(10))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let data = [1u8, 0];
        let mut r = Reader::new(&data);
        assert!(r.get_bool().unwrap());
        assert!(r.finish().is_err());
    }

    #[test]
    fn test_invalid_bool() {
        let mut r = Reader::new(&[2]);
        assert!(r.get_bool().is_err());
    }

    #[test]
    fn test_oversized_list_rejected() {
        let mut w = Writer::new();
        w.put_u32(1000);
        let bytes = w.finish();
        assert!(Reader::new(&bytes).get_i64_list().is_err());
    }
}
