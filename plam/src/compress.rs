//! Section, resource and payload codecs
//!
//! LZ4 (block format) and raw DEFLATE are built in. ZSTD, LZMA and Brotli ids
//! are recognised by the format but have no codec here.

use alloc::vec::Vec;

use crate::config::MAX_DECOMPRESSED_SIZE;
use crate::error::{LoadError, Result};
use crate::format::CompressionAlgorithm;

/// DEFLATE level used by the writer.
const DEFLATE_LEVEL: u8 = 6;

fn unsupported(alg: CompressionAlgorithm) -> LoadError {
    LoadError::UnknownCompressionAlgorithm(alg.raw())
}

/// Decompress a blob whose decoded length is known up front.
pub fn decompress(alg: CompressionAlgorithm, input: &[u8], expected_len: u64) -> Result<Vec<u8>> {
    let out = decompress_bounded(alg, input, expected_len)?;
    if out.len() as u64 != expected_len {
        return Err(LoadError::DecompressionFailed);
    }
    Ok(out)
}

/// Decompress at most `limit` bytes. Shorter output is returned as is.
pub fn decompress_bounded(alg: CompressionAlgorithm, input: &[u8], limit: u64) -> Result<Vec<u8>> {
    if limit > MAX_DECOMPRESSED_SIZE {
        return Err(LoadError::DecompressionFailed);
    }
    let limit = limit as usize;
    match alg {
        CompressionAlgorithm::None => Ok(input.to_vec()),
        CompressionAlgorithm::Lz4 => {
            lz4_flex::block::decompress(input, limit).map_err(|_| LoadError::DecompressionFailed)
        }
        CompressionAlgorithm::Deflate => {
            miniz_oxide::inflate::decompress_to_vec_with_limit(input, limit)
                .map_err(|_| LoadError::DecompressionFailed)
        }
        other => Err(unsupported(other)),
    }
}

/// Compress a blob; the decoded length is recorded separately by the caller.
pub fn compress(alg: CompressionAlgorithm, input: &[u8]) -> Result<Vec<u8>> {
    match alg {
        CompressionAlgorithm::None => Ok(input.to_vec()),
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::block::compress(input)),
        CompressionAlgorithm::Deflate => {
            Ok(miniz_oxide::deflate::compress_to_vec(input, DEFLATE_LEVEL))
        }
        other => Err(unsupported(other)),
    }
}

/// Decompress a whole-file payload, whose size is not recorded in the header.
pub fn decompress_payload(alg: CompressionAlgorithm, input: &[u8]) -> Result<Vec<u8>> {
    match alg {
        CompressionAlgorithm::None => Ok(input.to_vec()),
        CompressionAlgorithm::Lz4 => {
            let declared = input
                .get(..4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64)
                .ok_or(LoadError::DecompressionFailed)?;
            if declared > MAX_DECOMPRESSED_SIZE {
                return Err(LoadError::DecompressionFailed);
            }
            lz4_flex::block::decompress_size_prepended(input)
                .map_err(|_| LoadError::DecompressionFailed)
        }
        CompressionAlgorithm::Deflate => miniz_oxide::inflate::decompress_to_vec_with_limit(
            input,
            MAX_DECOMPRESSED_SIZE as usize,
        )
        .map_err(|_| LoadError::DecompressionFailed),
        other => Err(unsupported(other)),
    }
}

/// Inverse of [`decompress_payload`].
pub fn compress_payload(alg: CompressionAlgorithm, input: &[u8]) -> Result<Vec<u8>> {
    match alg {
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::block::compress_prepend_size(input)),
        other => compress(other, input),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        (0..4096u32).map(|i| (i % 17) as u8).collect()
    }

    #[test]
    fn test_lz4_and_deflate() {
        let data = sample();
        for alg in [CompressionAlgorithm::Lz4, CompressionAlgorithm::Deflate] {
            let packed = compress(alg, &data).unwrap();
            assert!(packed.len() < data.len());
            assert_eq!(decompress(alg, &packed, data.len() as u64).unwrap(), data);
        }
    }

    #[test]
    fn test_length_mismatch_fails() {
        let data = sample();
        let packed = compress(CompressionAlgorithm::Deflate, &data).unwrap();
        assert_eq!(
            decompress(CompressionAlgorithm::Deflate, &packed, 100),
            Err(LoadError::DecompressionFailed)
        );
        assert_eq!(
            decompress(CompressionAlgorithm::None, &data, 10),
            Err(LoadError::DecompressionFailed)
        );
    }

    #[test]
    fn test_unbuilt_codecs_are_unknown() {
        for alg in [
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Lzma,
            CompressionAlgorithm::Brotli,
            CompressionAlgorithm::Other(99),
        ] {
            assert_eq!(
                decompress(alg, &[1, 2, 3], 3),
                Err(LoadError::UnknownCompressionAlgorithm(alg.raw()))
            );
        }
    }

    #[test]
    fn test_payload_lz4_prefix() {
        let data = sample();
        let packed = compress_payload(CompressionAlgorithm::Lz4, &data).unwrap();
        assert_eq!(&packed[..4], &(data.len() as u32).to_le_bytes());
        assert_eq!(decompress_payload(CompressionAlgorithm::Lz4, &packed).unwrap(), data);
        assert!(decompress_payload(CompressionAlgorithm::Lz4, &packed[..2]).is_err());
    }

    #[test]
    fn test_garbage_fails() {
        assert_eq!(
            decompress(CompressionAlgorithm::Lz4, &[0xFF; 8], 64),
            Err(LoadError::DecompressionFailed)
        );
    }
}
