//! LZ4 block codec.
//!
//! Uses the raw block format without a size prefix: the uncompressed length
//! travels in the frame header and is handed back to `decompress`.

use super::{source_range, Codec, CodecKind, Compressor, Decompressor};
use crate::error::CodecError;

#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

impl Compressor for Lz4Codec {
    fn compress(&self, raw: &[u8], offset: usize, length: usize) -> Result<Vec<u8>, CodecError> {
        let src = source_range(raw, offset, length)?;
        Ok(lz4_flex::block::compress(src))
    }
}

impl Decompressor for Lz4Codec {
    fn decompress(
        &self,
        encoded: &[u8],
        offset: usize,
        length: usize,
        uncompressed_length: usize,
    ) -> Result<Vec<u8>, CodecError> {
        let src = source_range(encoded, offset, length)?;
        // Output larger than uncompressed_length is reported by lz4_flex itself
        let decoded = lz4_flex::block::decompress(src, uncompressed_length)
            .map_err(|e| CodecError::Decode(e.to_string()))?;

        if decoded.len() != uncompressed_length {
            return Err(CodecError::LengthMismatch {
                expected: uncompressed_length,
                actual: decoded.len(),
            });
        }
        Ok(decoded)
    }
}

impl Codec for Lz4Codec {
    fn kind(&self) -> CodecKind {
        CodecKind::Lz4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compresses_repetitive_payload() {
        let raw = b"replica-set ".repeat(200);
        let encoded = Lz4Codec.compress(&raw, 0, raw.len()).unwrap();
        assert!(encoded.len() < raw.len() / 4);

        let decoded = Lz4Codec.decompress(&encoded, 0, encoded.len(), raw.len()).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn test_short_declared_length_fails() {
        let raw = b"value value value value value value".to_vec();
        let encoded = Lz4Codec.compress(&raw, 0, raw.len()).unwrap();

        let result = Lz4Codec.decompress(&encoded, 0, encoded.len(), raw.len() - 1);
        assert!(result.is_err());
    }

    #[test]
    fn test_long_declared_length_is_mismatch() {
        let raw = b"value value value value value value".to_vec();
        let encoded = Lz4Codec.compress(&raw, 0, raw.len()).unwrap();

        let result = Lz4Codec.decompress(&encoded, 0, encoded.len(), raw.len() + 10);
        assert_eq!(
            result,
            Err(CodecError::LengthMismatch {
                expected: raw.len() + 10,
                actual: raw.len()
            })
        );
    }

    #[test]
    fn test_malformed_input_is_decode_error() {
        // Token claims a 15+ byte literal run that the input does not contain
        let garbage = [0xF0, 0xFF, 0xFF, 0x01];
        let result = Lz4Codec.decompress(&garbage, 0, garbage.len(), 64);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
