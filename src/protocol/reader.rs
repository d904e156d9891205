//! Buffered input cursor over an async byte source.
//!
//! Reads are destructive and one-directional. Running out of data exactly at a
//! value boundary is reported as `DecodeError::Eof`; running out inside a value
//! is `DecodeError::Truncated`. Both carry the logical byte offset.
//!
//! With compression enabled, bytes come from decoded frames pulled from the
//! same underlying source; the offset then counts decompressed bytes.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::compress::{CHECKSUM_SIZE, Decompressor, FRAME_HEADER_SIZE, FrameState};
use crate::error::{DecodeError, Error, Result};

/// Raw read granularity.
const READ_CHUNK: usize = 64 * 1024;

/// Default cap on a single length-prefixed string.
pub const DEFAULT_MAX_STRING_LEN: u64 = 1 << 30;

pub type Source<'a> = Box<dyn AsyncRead + Unpin + Send + 'a>;

pub struct Reader<'a> {
    src: Source<'a>,
    raw: BytesMut,
    offset: u64,
    frames: Option<Decompressor>,
    max_string_len: u64,
}

impl<'a> Reader<'a> {
    pub fn new(src: impl AsyncRead + Unpin + Send + 'a) -> Self {
        Self::from_boxed(Box::new(src))
    }

    pub fn from_boxed(src: Source<'a>) -> Self {
        Self {
            src,
            raw: BytesMut::with_capacity(READ_CHUNK),
            offset: 0,
            frames: None,
            max_string_len: DEFAULT_MAX_STRING_LEN,
        }
    }

    /// Reader over an in-memory byte slice.
    pub fn from_slice(b: &'a [u8]) -> Self {
        Self::new(b)
    }

    pub fn with_max_string_len(mut self, max: u64) -> Self {
        self.max_string_len = max;
        self
    }

    pub fn set_max_string_len(&mut self, max: u64) {
        self.max_string_len = max;
    }

    /// Logical bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Pull subsequent bytes from compressed frames.
    pub fn enable_compression(&mut self, verify_checksum: bool) {
        if self.frames.is_none() {
            self.frames = Some(Decompressor::new(verify_checksum));
        }
    }

    /// Back to raw bytes. Undelivered decompressed bytes are dropped.
    pub fn disable_compression(&mut self) {
        if let Some(d) = self.frames.take() {
            let left = d.available().len();
            if left > 0 {
                tracing::warn!(left, "dropping unread decompressed bytes");
            }
        }
    }

    pub fn compression_enabled(&self) -> bool {
        self.frames.is_some()
    }

    // ==================== RAW LAYER ====================

    /// Make at least one raw byte available. Returns false on end of source.
    async fn fill_raw(&mut self) -> Result<bool> {
        if !self.raw.is_empty() {
            return Ok(true);
        }
        self.raw.reserve(READ_CHUNK);
        let n = self.src.read_buf(&mut self.raw).await?;
        Ok(n > 0)
    }

    /// Copy exactly `out.len()` raw bytes. Returns how many were copied before
    /// the source ended.
    async fn read_raw(&mut self, out: &mut [u8]) -> Result<usize> {
        let mut n = 0;
        while n < out.len() {
            if !self.fill_raw().await? {
                break;
            }
            let take = (out.len() - n).min(self.raw.len());
            out[n..n + take].copy_from_slice(&self.raw[..take]);
            self.raw.advance(take);
            n += take;
        }
        Ok(n)
    }

    // ==================== FRAME LAYER ====================

    /// Decode the next frame. Returns false if the source ended cleanly before it.
    async fn next_frame(&mut self) -> Result<bool> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let got = self.read_raw(&mut header).await?;
        if got == 0 {
            return Ok(false);
        }
        if got < FRAME_HEADER_SIZE {
            return Err(self.truncated(FRAME_HEADER_SIZE, got));
        }

        let frames = self
            .frames
            .as_mut()
            .ok_or_else(|| DecodeError::invalid("compression is not enabled"))?;
        let payload_len = frames.on_header(&header)?;

        // Body = the 9 header bytes covered by the checksum, then the payload.
        let mut body = vec![0u8; FRAME_HEADER_SIZE - CHECKSUM_SIZE + payload_len];
        body[..FRAME_HEADER_SIZE - CHECKSUM_SIZE].copy_from_slice(&header[CHECKSUM_SIZE..]);
        let got = self
            .read_raw(&mut body[FRAME_HEADER_SIZE - CHECKSUM_SIZE..])
            .await?;
        if got < payload_len {
            return Err(self.truncated(payload_len, got));
        }

        if let Some(frames) = self.frames.as_mut() {
            frames.on_body(&body)?;
        }
        Ok(true)
    }

    // ==================== LOGICAL LAYER ====================

    /// Number of logical bytes available without further I/O, pulling one
    /// frame or one raw chunk if nothing is buffered. Zero means end of source.
    async fn fill(&mut self) -> Result<usize> {
        if self.frames.is_some() {
            loop {
                let ready = match self.frames.as_ref() {
                    Some(d) => match d.state() {
                        FrameState::Decoded { .. } => d.available().len(),
                        _ => 0,
                    },
                    None => 0,
                };
                if ready > 0 {
                    return Ok(ready);
                }
                // Zero-length frames carry nothing; keep pulling.
                if !self.next_frame().await? {
                    return Ok(0);
                }
            }
        }
        if self.fill_raw().await? {
            Ok(self.raw.len())
        } else {
            Ok(0)
        }
    }

    fn available(&self) -> &[u8] {
        match &self.frames {
            Some(d) => d.available(),
            None => &self.raw,
        }
    }

    fn consume(&mut self, n: usize) {
        match &mut self.frames {
            Some(d) => d.consume(n),
            None => self.raw.advance(n),
        }
        self.offset += n as u64;
    }

    fn truncated(&self, needed: usize, got: usize) -> Error {
        Error::Decode(DecodeError::Truncated {
            offset: self.offset,
            needed,
            got,
        })
    }

    /// Fill `out` completely. A value that cannot start is `Eof`; a value
    /// that starts but cannot finish is `Truncated`.
    pub async fn read_full(&mut self, out: &mut [u8]) -> Result<()> {
        let start = self.offset;
        let mut n = 0;
        while n < out.len() {
            let ready = self.fill().await?;
            if ready == 0 {
                return Err(if n == 0 {
                    Error::Decode(DecodeError::Eof { offset: start })
                } else {
                    Error::Decode(DecodeError::Truncated {
                        offset: start,
                        needed: out.len(),
                        got: n,
                    })
                });
            }
            let take = (out.len() - n).min(ready);
            out[n..n + take].copy_from_slice(&self.available()[..take]);
            self.consume(take);
            n += take;
        }
        Ok(())
    }

    /// Continue a value whose first bytes were already consumed: any short
    /// read from here on is `Truncated`.
    async fn read_rest(&mut self, out: &mut [u8], value_start: u64) -> Result<()> {
        self.read_full(out).await.map_err(|e| match e {
            Error::Decode(DecodeError::Eof { .. }) => Error::Decode(DecodeError::Truncated {
                offset: value_start,
                needed: out.len(),
                got: 0,
            }),
            other => other,
        })
    }

    /// Append `n` bytes to `out` without trusting `n` for an upfront allocation.
    pub async fn read_into_vec(&mut self, n: usize, out: &mut Vec<u8>) -> Result<()> {
        let start = self.offset;
        let mut left = n;
        while left > 0 {
            let ready = self.fill().await?;
            if ready == 0 {
                let got = n - left;
                return Err(Error::Decode(if got == 0 {
                    DecodeError::Eof { offset: start }
                } else {
                    DecodeError::Truncated {
                        offset: start,
                        needed: n,
                        got,
                    }
                }));
            }
            let take = left.min(ready);
            out.extend_from_slice(&self.available()[..take]);
            self.consume(take);
            left -= take;
        }
        Ok(())
    }

    /// Whether the source is exhausted at a value boundary.
    pub async fn at_eof(&mut self) -> Result<bool> {
        Ok(self.fill().await? == 0)
    }

    // ==================== VALUES ====================

    pub async fn varint(&mut self) -> Result<u64> {
        let start = self.offset;
        let mut x: u64 = 0;
        for i in 0..10u32 {
            let mut b = [0u8; 1];
            if i == 0 {
                self.read_full(&mut b).await?;
            } else {
                self.read_rest(&mut b, start).await?;
            }
            let byte = b[0];
            if i == 9 && byte > 1 {
                return Err(DecodeError::VarintOverflow { offset: start }.into());
            }
            x |= ((byte & 0x7f) as u64) << (7 * i);
            if byte < 0x80 {
                return Ok(x);
            }
        }
        Err(DecodeError::VarintOverflow { offset: start }.into())
    }

    /// Varint that must fit in `usize` and stay under `max`.
    pub async fn varint_bounded(&mut self, what: &'static str, max: u64) -> Result<usize> {
        let v = self.varint().await?;
        if v > max {
            return Err(DecodeError::Bound { what, value: v, max }.into());
        }
        Ok(v as usize)
    }

    /// Length-prefixed raw bytes.
    pub async fn bytes(&mut self) -> Result<Vec<u8>> {
        let start = self.offset;
        let max = self.max_string_len;
        let n = self.varint_bounded("string length", max).await?;
        let mut out = Vec::new();
        if n > 0 {
            self.read_into_vec(n, &mut out).await.map_err(|e| match e {
                Error::Decode(DecodeError::Eof { .. }) => Error::Decode(DecodeError::Truncated {
                    offset: start,
                    needed: n,
                    got: 0,
                }),
                other => other,
            })?;
        }
        Ok(out)
    }

    /// Length-prefixed UTF-8 string.
    pub async fn str(&mut self) -> Result<String> {
        let start = self.offset;
        let b = self.bytes().await?;
        String::from_utf8(b).map_err(|_| DecodeError::InvalidUtf8 { offset: start }.into())
    }

    /// Append a length-prefixed value to `arena`, returning its span.
    /// Used by the String column to avoid a per-row allocation.
    pub async fn bytes_into(&mut self, arena: &mut Vec<u8>) -> Result<(usize, usize)> {
        let start_offset = self.offset;
        let max = self.max_string_len;
        let n = self.varint_bounded("string length", max).await?;
        let start = arena.len();
        if n > 0 {
            self.read_into_vec(n, arena).await.map_err(|e| match e {
                Error::Decode(DecodeError::Eof { .. }) => Error::Decode(DecodeError::Truncated {
                    offset: start_offset,
                    needed: n,
                    got: 0,
                }),
                other => other,
            })?;
        }
        Ok((start, arena.len()))
    }

    pub async fn bool(&mut self) -> Result<bool> {
        let offset = self.offset;
        match self.u8().await? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(DecodeError::InvalidBool { offset, value }.into()),
        }
    }

    pub async fn u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_full(&mut b).await?;
        Ok(b[0])
    }

    pub async fn i8(&mut self) -> Result<i8> {
        Ok(self.u8().await? as i8)
    }

    pub async fn u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_full(&mut b).await?;
        Ok(u16::from_le_bytes(b))
    }

    pub async fn i16(&mut self) -> Result<i16> {
        Ok(self.u16().await? as i16)
    }

    pub async fn u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_full(&mut b).await?;
        Ok(u32::from_le_bytes(b))
    }

    pub async fn i32(&mut self) -> Result<i32> {
        Ok(self.u32().await? as i32)
    }

    pub async fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_full(&mut b).await?;
        Ok(u64::from_le_bytes(b))
    }

    pub async fn i64(&mut self) -> Result<i64> {
        Ok(self.u64().await? as i64)
    }

    pub async fn u128(&mut self) -> Result<u128> {
        let mut b = [0u8; 16];
        self.read_full(&mut b).await?;
        Ok(u128::from_le_bytes(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::buffer::Buffer;
    use crate::protocol::compress::{Method, encode_frame};

    #[tokio::test]
    async fn test_varint_round_trip() {
        let values = [0u64, 1, 127, 128, 300, 1 << 35, u64::MAX];
        let mut b = Buffer::new();
        for v in values {
            b.put_varint(v);
        }
        let mut r = Reader::from_slice(b.as_slice());
        for v in values {
            assert_eq!(r.varint().await.unwrap(), v);
        }
        assert!(r.at_eof().await.unwrap());
    }

    #[tokio::test]
    async fn test_varint_overflow() {
        let bytes = [0xffu8, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02];
        let mut r = Reader::from_slice(&bytes);
        assert!(matches!(
            r.varint().await,
            Err(Error::Decode(DecodeError::VarintOverflow { offset: 0 }))
        ));
    }

    #[tokio::test]
    async fn test_clean_eof_vs_truncated() {
        let mut r = Reader::from_slice(&[]);
        assert!(matches!(
            r.u64().await,
            Err(Error::Decode(DecodeError::Eof { offset: 0 }))
        ));

        let mut r = Reader::from_slice(&[1, 2, 3]);
        assert!(matches!(
            r.u64().await,
            Err(Error::Decode(DecodeError::Truncated {
                offset: 0,
                needed: 8,
                got: 3
            }))
        ));

        // Varint continuation byte missing.
        let mut r = Reader::from_slice(&[0x80]);
        assert!(matches!(
            r.varint().await,
            Err(Error::Decode(DecodeError::Truncated { .. }))
        ));

        // Length present, body missing.
        let mut r = Reader::from_slice(&[5, b'a']);
        assert!(matches!(
            r.str().await,
            Err(Error::Decode(DecodeError::Truncated { .. }))
        ));
    }

    #[tokio::test]
    async fn test_string_checks() {
        let mut r = Reader::from_slice(&[2, 0xc3, 0x28]);
        assert!(matches!(
            r.str().await,
            Err(Error::Decode(DecodeError::InvalidUtf8 { offset: 0 }))
        ));

        let mut b = Buffer::new();
        b.put_varint(1 << 40);
        let mut r = Reader::from_slice(b.as_slice());
        assert!(matches!(
            r.str().await,
            Err(Error::Decode(DecodeError::Bound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_bool_rejects_other_bytes() {
        let mut r = Reader::from_slice(&[0, 1, 2]);
        assert!(!r.bool().await.unwrap());
        assert!(r.bool().await.unwrap());
        assert!(matches!(
            r.bool().await,
            Err(Error::Decode(DecodeError::InvalidBool { offset: 2, value: 2 }))
        ));
    }

    #[tokio::test]
    async fn test_compressed_values_span_frames() {
        let mut first = Buffer::new();
        first.put_string("hello");
        first.put_u32(0xdead_beef);
        let split = first.len() - 2;

        let mut wire = Buffer::new();
        // Plain prefix, then two frames splitting the u32 across them.
        wire.put_varint(42);
        encode_frame(Method::Lz4, 0, &first.as_slice()[..split], &mut wire).unwrap();
        encode_frame(Method::Zstd, 1, &first.as_slice()[split..], &mut wire).unwrap();
        wire.put_varint(7);

        let mut r = Reader::from_slice(wire.as_slice());
        assert_eq!(r.varint().await.unwrap(), 42);
        r.enable_compression(true);
        assert_eq!(r.str().await.unwrap(), "hello");
        assert_eq!(r.u32().await.unwrap(), 0xdead_beef);
        r.disable_compression();
        assert_eq!(r.varint().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let mut wire = Buffer::new();
        encode_frame(Method::Lz4, 0, b"some payload bytes", &mut wire).unwrap();
        let cut = &wire.as_slice()[..wire.len() - 3];
        let mut r = Reader::from_slice(cut);
        r.enable_compression(true);
        let err = r.u8().await.unwrap_err();
        assert!(matches!(err, Error::Decode(DecodeError::Truncated { .. })));
    }
}
