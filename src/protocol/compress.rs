//! Compressed-block framing.
//!
//! ```text
//! [checksum: 16][method: 1][compressed_size: u32][raw_size: u32][payload]
//! ```
//!
//! `compressed_size` counts the 9 method+size bytes plus the payload. The
//! checksum is CityHash128 v1.0.2 over those same bytes.
//!
//! Decoding is driven by `Decompressor`, a small state machine:
//! `AwaitingHeader -> AwaitingPayload -> Decoded -> AwaitingHeader`.
//! The caller performs the I/O and feeds it exactly the bytes each state asks for.

use super::buffer::Buffer;
use super::city::{U128, city_hash128};
use crate::error::DecodeError;

pub const CHECKSUM_SIZE: usize = 16;
/// Method byte plus both sizes.
pub const HEADER_SIZE: usize = 9;
pub const FRAME_HEADER_SIZE: usize = CHECKSUM_SIZE + HEADER_SIZE;

pub const MAX_COMPRESSED_SIZE: u32 = 128 * 1024 * 1024;
pub const MAX_RAW_SIZE: u32 = 128 * 1024 * 1024;

/// Raw bytes per frame when encoding.
pub const FRAME_CHUNK: usize = 1024 * 1024;

const METHOD_NONE: u8 = 0x02;
const METHOD_LZ4: u8 = 0x82;
const METHOD_ZSTD: u8 = 0x90;

/// Codec used for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    None,
    #[default]
    Lz4,
    /// Same wire byte and decoder as `Lz4`; only the encoder works harder.
    Lz4Hc,
    Zstd,
}

impl Method {
    pub fn wire_byte(self) -> u8 {
        match self {
            Method::None => METHOD_NONE,
            Method::Lz4 | Method::Lz4Hc => METHOD_LZ4,
            Method::Zstd => METHOD_ZSTD,
        }
    }

    pub fn from_wire(b: u8) -> Result<Self, DecodeError> {
        match b {
            METHOD_NONE => Ok(Method::None),
            METHOD_LZ4 => Ok(Method::Lz4),
            METHOD_ZSTD => Ok(Method::Zstd),
            other => Err(DecodeError::UnknownMethod(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Method::None => "none",
            Method::Lz4 => "lz4",
            Method::Lz4Hc => "lz4hc",
            Method::Zstd => "zstd",
        }
    }
}

/// Parsed, bounds-checked frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub checksum: U128,
    pub method: Method,
    pub compressed_size: u32,
    pub raw_size: u32,
}

impl FrameHeader {
    /// Parse and validate a header before anything is allocated for the payload.
    pub fn parse(b: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, DecodeError> {
        let mut checksum = [0u8; CHECKSUM_SIZE];
        checksum.copy_from_slice(&b[..CHECKSUM_SIZE]);
        let method = Method::from_wire(b[16])?;
        let compressed_size = u32::from_le_bytes([b[17], b[18], b[19], b[20]]);
        let raw_size = u32::from_le_bytes([b[21], b[22], b[23], b[24]]);

        if (compressed_size as usize) < HEADER_SIZE {
            return Err(DecodeError::invalid(format!(
                "compressed size {} is smaller than the frame header",
                compressed_size
            )));
        }
        if compressed_size > MAX_COMPRESSED_SIZE {
            return Err(DecodeError::Bound {
                what: "compressed frame size",
                value: compressed_size as u64,
                max: MAX_COMPRESSED_SIZE as u64,
            });
        }
        if raw_size > MAX_RAW_SIZE {
            return Err(DecodeError::Bound {
                what: "raw frame size",
                value: raw_size as u64,
                max: MAX_RAW_SIZE as u64,
            });
        }

        Ok(Self {
            checksum: U128::from_le_bytes(&checksum),
            method,
            compressed_size,
            raw_size,
        })
    }

    /// Bytes following the 25-byte header.
    pub fn payload_len(&self) -> usize {
        self.compressed_size as usize - HEADER_SIZE
    }
}

fn compress_err(method: Method, e: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(format!("{} compression failed: {}", method.name(), e))
}

/// Append one frame holding `data` to `out`. Always recomputes the checksum.
pub fn encode_frame(
    method: Method,
    level: i32,
    data: &[u8],
    out: &mut Buffer,
) -> std::io::Result<()> {
    if data.len() > MAX_RAW_SIZE as usize {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {}", data.len(), MAX_RAW_SIZE),
        ));
    }

    let payload: Vec<u8> = match method {
        Method::None => data.to_vec(),
        Method::Lz4 | Method::Lz4Hc => {
            let mode = if method == Method::Lz4Hc {
                lz4::block::CompressionMode::HIGHCOMPRESSION(level.max(1))
            } else {
                lz4::block::CompressionMode::DEFAULT
            };
            let bound = lz4::block::compress_bound(data.len())?;
            let mut enc = vec![0u8; bound];
            let n = lz4::block::compress_to_buffer(data, Some(mode), false, &mut enc)
                .map_err(|e| compress_err(method, e))?;
            enc.truncate(n);
            enc
        }
        Method::Zstd => zstd::bulk::compress(data, level).map_err(|e| compress_err(method, e))?,
    };

    let compressed_size = (HEADER_SIZE + payload.len()) as u32;
    let mut body = Vec::with_capacity(compressed_size as usize);
    body.push(method.wire_byte());
    body.extend_from_slice(&compressed_size.to_le_bytes());
    body.extend_from_slice(&(data.len() as u32).to_le_bytes());
    body.extend_from_slice(&payload);

    out.put_raw(&city_hash128(&body).to_le_bytes());
    out.put_raw(&body);
    Ok(())
}

/// Split `data` into frames of at most `FRAME_CHUNK` raw bytes.
pub fn encode_frames(
    method: Method,
    level: i32,
    data: &[u8],
    out: &mut Buffer,
) -> std::io::Result<()> {
    for chunk in data.chunks(FRAME_CHUNK) {
        encode_frame(method, level, chunk, out)?;
    }
    Ok(())
}

/// Decode a frame body (`[method][sizes][payload]`, i.e. everything after the checksum).
pub fn decode_frame(
    header: &FrameHeader,
    body: &[u8],
    verify_checksum: bool,
) -> Result<Vec<u8>, DecodeError> {
    if body.len() != header.compressed_size as usize {
        return Err(DecodeError::invalid(format!(
            "frame body is {} bytes, header declares {}",
            body.len(),
            header.compressed_size
        )));
    }
    if verify_checksum {
        let actual = city_hash128(body);
        if actual != header.checksum {
            return Err(DecodeError::Checksum {
                expected: header.checksum.to_u128(),
                actual: actual.to_u128(),
            });
        }
    }

    let payload = &body[HEADER_SIZE..];
    let raw_size = header.raw_size as usize;
    let data = match header.method {
        Method::None => payload.to_vec(),
        Method::Lz4 | Method::Lz4Hc => {
            let mut out = vec![0u8; raw_size];
            let n = lz4::block::decompress_to_buffer(payload, Some(raw_size as i32), &mut out)
                .map_err(|e| DecodeError::Decompress(format!("lz4: {}", e)))?;
            out.truncate(n);
            out
        }
        Method::Zstd => zstd::bulk::decompress(payload, raw_size)
            .map_err(|e| DecodeError::Decompress(format!("zstd: {}", e)))?,
    };

    if data.len() != raw_size {
        return Err(DecodeError::Decompress(format!(
            "{} frame decoded to {} bytes, header declares {}",
            header.method.name(),
            data.len(),
            raw_size
        )));
    }
    Ok(data)
}

/// Where the decompressor is in the current frame.
#[derive(Debug, Default)]
pub enum FrameState {
    #[default]
    AwaitingHeader,
    AwaitingPayload(FrameHeader),
    Decoded {
        data: Vec<u8>,
        pos: usize,
    },
}

/// Frame-at-a-time decompressor. One frame is decoded per exhausted output.
#[derive(Debug)]
pub struct Decompressor {
    state: FrameState,
    verify_checksum: bool,
}

impl Decompressor {
    pub fn new(verify_checksum: bool) -> Self {
        Self {
            state: FrameState::AwaitingHeader,
            verify_checksum,
        }
    }

    pub fn state(&self) -> &FrameState {
        &self.state
    }

    /// Decoded bytes not yet consumed. Empty unless in `Decoded`.
    pub fn available(&self) -> &[u8] {
        match &self.state {
            FrameState::Decoded { data, pos } => &data[*pos..],
            _ => &[],
        }
    }

    /// Consume `n` decoded bytes; an exhausted frame returns to `AwaitingHeader`.
    pub fn consume(&mut self, n: usize) {
        if let FrameState::Decoded { data, pos } = &mut self.state {
            *pos = (*pos + n).min(data.len());
            if *pos == data.len() {
                self.state = FrameState::AwaitingHeader;
            }
        }
    }

    /// Feed the 25 header bytes. Returns how many payload bytes to read next.
    pub fn on_header(&mut self, b: &[u8; FRAME_HEADER_SIZE]) -> Result<usize, DecodeError> {
        if !matches!(self.state, FrameState::AwaitingHeader) {
            return Err(DecodeError::invalid("frame header fed mid-frame"));
        }
        let header = FrameHeader::parse(b)?;
        let n = header.payload_len();
        tracing::trace!(
            method = header.method.name(),
            compressed = header.compressed_size,
            raw = header.raw_size,
            "frame header"
        );
        self.state = FrameState::AwaitingPayload(header);
        Ok(n)
    }

    /// Feed the frame body (9 header bytes followed by the payload).
    pub fn on_body(&mut self, body: &[u8]) -> Result<(), DecodeError> {
        let header = match &self.state {
            FrameState::AwaitingPayload(h) => *h,
            _ => return Err(DecodeError::invalid("frame payload fed without a header")),
        };
        // A failed frame leaves the stream unusable; park in AwaitingHeader.
        self.state = FrameState::AwaitingHeader;
        let data = decode_frame(&header, body, self.verify_checksum)?;
        if !data.is_empty() {
            self.state = FrameState::Decoded { data, pos: 0 };
        }
        Ok(())
    }
}
