//! Wire framing for codec payloads.
//!
//! ```text
//! +----------------+--------------------+-------------------------+
//! | encoded_len    | uncompressed_len   | codec output            |
//! | u32 big-endian | u32 big-endian     | encoded_len bytes       |
//! +----------------+--------------------+-------------------------+
//! ```
//!
//! The uncompressed length is what the receiver passes to
//! `Decompressor::decompress`, so heterogeneous codecs never need to embed
//! their own size metadata.

use crate::codec::{Compressor, Decompressor};
use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Default upper bound on `encoded_len` and `uncompressed_len`.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub encoded_len: u32,
    pub uncompressed_len: u32,
}

impl FrameHeader {
    /// Parse a header from the first `HEADER_LEN` bytes of `buf`.
    ///
    /// Returns `None` if fewer than `HEADER_LEN` bytes are available.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let mut header = buf.get(..HEADER_LEN)?;
        Some(Self {
            encoded_len: header.get_u32(),
            uncompressed_len: header.get_u32(),
        })
    }

    /// Append the header in wire order.
    pub fn put(&self, out: &mut BytesMut) {
        out.put_u32(self.encoded_len);
        out.put_u32(self.uncompressed_len);
    }

    /// Total frame length including the header.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.encoded_len as usize
    }
}

/// Compress `payload` and wrap it in a frame.
pub fn encode<C>(compressor: &C, payload: &[u8]) -> Result<Bytes, FrameError>
where
    C: Compressor + ?Sized,
{
    let uncompressed_len =
        u32::try_from(payload.len()).map_err(|_| FrameError::Oversize(payload.len()))?;
    let encoded = compressor.compress(payload, 0, payload.len())?;
    let encoded_len =
        u32::try_from(encoded.len()).map_err(|_| FrameError::Oversize(encoded.len()))?;

    let mut out = BytesMut::with_capacity(HEADER_LEN + encoded.len());
    FrameHeader {
        encoded_len,
        uncompressed_len,
    }
    .put(&mut out);
    out.extend_from_slice(&encoded);
    Ok(out.freeze())
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched (contents and capacity)
/// until a complete frame is buffered. On success exactly one frame is consumed. Headers announcing a
/// frame larger than `max_frame_size` fail before the body is awaited.
pub fn decode<D>(
    buf: &mut BytesMut,
    decompressor: &D,
    max_frame_size: usize,
) -> Result<Option<Vec<u8>>, FrameError>
where
    D: Decompressor + ?Sized,
{
    let header = match FrameHeader::parse(&buf[..]) {
        Some(header) => header,
        None => return Ok(None),
    };

    let encoded_len = header.encoded_len as usize;
    let uncompressed_len = header.uncompressed_len as usize;
    let largest = encoded_len.max(uncompressed_len);
    if largest > max_frame_size {
        return Err(FrameError::TooLarge {
            len: largest,
            max: max_frame_size,
        });
    }

    // The buffer grows as body bytes arrive, never on the header's word alone
    if buf.len() < header.frame_len() {
        return Ok(None);
    }

    let frame = buf.split_to(header.frame_len());
    let payload = decompressor.decompress(&frame, HEADER_LEN, encoded_len, uncompressed_len)?;
    Ok(Some(payload))
}
