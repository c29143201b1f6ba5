//! Payload codecs.
//!
//! Every message payload crossing the wire passes through a codec pair:
//! a `Compressor` on the sending side and a `Decompressor` on the receiving
//! side. Length bookkeeping is not part of the codec output; the frame header
//! carries both the encoded and the uncompressed length.
//!
//! ## Contract
//!
//! - `compress(raw, offset, length)` reads exactly `length` bytes starting at
//!   `offset` and returns a fresh buffer holding only the encoded bytes.
//! - `decompress(encoded, offset, length, uncompressed_length)` decodes exactly
//!   `length` bytes and fails with `CodecError::LengthMismatch` unless the
//!   result is `uncompressed_length` bytes long.
//! - `decompress(compress(b)) == b` for every supported input.
//!
//! A codec is chosen once per connection and never changes for its lifetime.

mod lz4;
mod null;

pub use lz4::Lz4Codec;
pub use null::NullCodec;

use crate::error::CodecError;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// Encoding half of a codec pair.
pub trait Compressor: Send + Sync {
    fn compress(&self, raw: &[u8], offset: usize, length: usize) -> Result<Vec<u8>, CodecError>;
}

/// Decoding half of a codec pair.
pub trait Decompressor: Send + Sync {
    fn decompress(
        &self,
        encoded: &[u8],
        offset: usize,
        length: usize,
        uncompressed_length: usize,
    ) -> Result<Vec<u8>, CodecError>;
}

/// A compressor and decompressor for the same format.
pub trait Codec: Compressor + Decompressor + fmt::Debug {
    /// Format implemented by this codec.
    fn kind(&self) -> CodecKind;
}

/// Codec formats available to connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Identity transform.
    Null,
    /// LZ4 block format.
    Lz4,
}

impl CodecKind {
    /// Instantiate a codec of this kind.
    pub fn build(self) -> Arc<dyn Codec> {
        match self {
            CodecKind::Null => Arc::new(NullCodec),
            CodecKind::Lz4 => Arc::new(Lz4Codec),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::Null => f.write_str("null"),
            CodecKind::Lz4 => f.write_str("lz4"),
        }
    }
}

/// Borrow `length` bytes of `src` starting at `offset`.
pub(crate) fn source_range(src: &[u8], offset: usize, length: usize) -> Result<&[u8], CodecError> {
    offset
        .checked_add(length)
        .and_then(|end| src.get(offset..end))
        .ok_or(CodecError::InvalidRange {
            offset,
            length,
            available: src.len(),
        })
}
