//! Identity codec.

use super::{source_range, Codec, CodecKind, Compressor, Decompressor};
use crate::error::CodecError;

/// Passes payloads through unchanged.
///
/// Since output length always equals input length, `decompress` rejects any
/// call where `length != uncompressed_length` before touching the input.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCodec;

impl Compressor for NullCodec {
    fn compress(&self, raw: &[u8], offset: usize, length: usize) -> Result<Vec<u8>, CodecError> {
        Ok(source_range(raw, offset, length)?.to_vec())
    }
}

impl Decompressor for NullCodec {
    fn decompress(
        &self,
        encoded: &[u8],
        offset: usize,
        length: usize,
        uncompressed_length: usize,
    ) -> Result<Vec<u8>, CodecError> {
        if length != uncompressed_length {
            return Err(CodecError::LengthMismatch {
                expected: uncompressed_length,
                actual: length,
            });
        }
        Ok(source_range(encoded, offset, length)?.to_vec())
    }
}

impl Codec for NullCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8; 13] = b"\x00\x01abc\xffdefg\x7f\x80z";

    #[test]
    fn test_compress_is_identity() {
        let encoded = NullCodec.compress(PAYLOAD, 0, 13).unwrap();
        assert_eq!(encoded.len(), 13);
        assert_eq!(&encoded[..], &PAYLOAD[..]);
    }

    #[test]
    fn test_decompress_exact_length() {
        let encoded = NullCodec.compress(PAYLOAD, 0, 13).unwrap();
        let decoded = NullCodec.decompress(&encoded, 0, 13, 13).unwrap();
        assert_eq!(&decoded[..], &PAYLOAD[..]);
    }

    #[test]
    fn test_decompress_length_mismatch() {
        let encoded = NullCodec.compress(PAYLOAD, 0, 13).unwrap();

        let result = NullCodec.decompress(&encoded, 0, 13, 12);
        assert_eq!(
            result,
            Err(CodecError::LengthMismatch {
                expected: 12,
                actual: 13
            })
        );
    }

    #[test]
    fn test_length_mismatch_never_truncates_or_pads() {
        let data = [7u8; 64];
        for length in 0..=16usize {
            for expected in 0..=16usize {
                let result = NullCodec.decompress(&data, 0, length, expected);
                if length == expected {
                    assert_eq!(result.unwrap().len(), length);
                } else {
                    assert!(matches!(result, Err(CodecError::LengthMismatch { .. })));
                }
            }
        }
    }

    #[test]
    fn test_compress_does_not_touch_source() {
        let raw = PAYLOAD.to_vec();
        let _ = NullCodec.compress(&raw, 2, 5).unwrap();
        assert_eq!(&raw[..], &PAYLOAD[..]);
    }
}
