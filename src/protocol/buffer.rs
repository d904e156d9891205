//! Append-only output buffer.
//!
//! Every `put_*` is self-delimiting: the matching `Reader` call knows how many
//! bytes to consume without outside metadata. Fixed-width values are little-endian.

use bytes::{BufMut, BytesMut};

/// Growable write buffer backed by `BytesMut`.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    pub buf: BytesMut,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Truncate, keeping capacity.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Unsigned LEB128, 1 to 10 bytes.
    pub fn put_varint(&mut self, mut v: u64) {
        while v >= 0x80 {
            self.buf.put_u8((v as u8) | 0x80);
            v >>= 7;
        }
        self.buf.put_u8(v as u8);
    }

    /// Varint length followed by UTF-8 bytes.
    pub fn put_string(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    /// Varint length followed by raw bytes.
    pub fn put_bytes(&mut self, b: &[u8]) {
        self.put_varint(b.len() as u64);
        self.buf.put_slice(b);
    }

    /// Raw bytes, no length prefix.
    #[inline]
    pub fn put_raw(&mut self, b: &[u8]) {
        self.buf.put_slice(b);
    }

    #[inline]
    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    #[inline]
    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    #[inline]
    pub fn put_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    #[inline]
    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    #[inline]
    pub fn put_i16(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    #[inline]
    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    #[inline]
    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    #[inline]
    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    #[inline]
    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    #[inline]
    pub fn put_u128(&mut self, v: u128) {
        self.buf.put_u128_le(v);
    }

    #[inline]
    pub fn put_i128(&mut self, v: i128) {
        self.buf.put_i128_le(v);
    }

    #[inline]
    pub fn put_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    #[inline]
    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_widths() {
        let cases: [(u64, &[u8]); 5] = [
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (300, &[0xac, 0x02]),
        ];
        for (value, expected) in cases {
            let mut b = Buffer::new();
            b.put_varint(value);
            assert_eq!(b.as_slice(), expected, "varint {}", value);
        }

        let mut b = Buffer::new();
        b.put_varint(u64::MAX);
        assert_eq!(b.len(), 10);
        assert_eq!(b.as_slice()[9], 0x01);
    }

    #[test]
    fn test_string_is_length_prefixed() {
        let mut b = Buffer::new();
        b.put_string("foo");
        b.put_string("");
        assert_eq!(b.as_slice(), &[3, b'f', b'o', b'o', 0]);
    }

    #[test]
    fn test_fixed_width_little_endian() {
        let mut b = Buffer::new();
        b.put_u32(0x0102_0304);
        b.put_i16(-2);
        b.put_bool(true);
        assert_eq!(b.as_slice(), &[4, 3, 2, 1, 0xfe, 0xff, 1]);
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut b = Buffer::with_capacity(64);
        b.put_u64(7);
        let cap = b.buf.capacity();
        b.reset();
        assert!(b.is_empty());
        assert_eq!(b.buf.capacity(), cap);
    }
}
