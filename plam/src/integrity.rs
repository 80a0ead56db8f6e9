//! Integrity Verification
//!
//! Header CRC-32, whole-file build hash, resource content hashes and the
//! optional Ed25519 signature block.

use alloc::vec::Vec;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256, Sha384};

use crate::codec::{Record, Rva};
use crate::header::{ContainerHeader, CRC_OFFSET};
use crate::format::{HashType, SignatureScheme};
use crate::tables::{ResourceDescriptor, SecurityBlob};

/// Outcome of signature verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    Valid,
    /// No signature present.
    Unsigned,
    /// Scheme this loader cannot check.
    UnknownAlgorithm,
    Invalid,
}

/// CRC-32/ISO-HDLC.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// CRC-32 of a header with its checksum field treated as zero.
pub fn header_checksum(header_bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    if header_bytes.len() < CRC_OFFSET + 4 {
        hasher.update(header_bytes);
        return hasher.finalize();
    }
    hasher.update(&header_bytes[..CRC_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&header_bytes[CRC_OFFSET + 4..]);
    hasher.finalize()
}

/// Compare the stored `hdr_crc32` with the recomputed one.
///
/// `header_bytes` must be exactly the `hdr_size` bytes of the header.
pub fn verify_header_checksum(header_bytes: &[u8]) -> bool {
    let Some(stored) = header_bytes.get(CRC_OFFSET..CRC_OFFSET + 4) else {
        return false;
    };
    let stored = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
    stored == header_checksum(header_bytes)
}

/// Write the checksum into an encoded header in place.
pub fn seal_header(header_bytes: &mut [u8]) {
    if header_bytes.len() < CRC_OFFSET + 4 {
        return;
    }
    let crc = header_checksum(header_bytes);
    header_bytes[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
}

/// Build hash over the logical container after the header, skipping the
/// security blob. `None` when `hash_type` declares no (or an unknown) hash.
pub fn build_hash(
    hash_type: HashType,
    container: &[u8],
    hdr_size: usize,
    security: Rva,
) -> Option<[u8; 32]> {
    let body = container.get(hdr_size..).unwrap_or(&[]);
    let parts = split_out(body, hdr_size as u64, security);
    match hash_type {
        HashType::Sha2 => {
            let mut hasher = Sha256::new();
            for part in parts {
                hasher.update(part);
            }
            let mut out = [0u8; 32];
            out.copy_from_slice(&hasher.finalize());
            Some(out)
        }
        HashType::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            for part in parts {
                hasher.update(part);
            }
            Some(*hasher.finalize().as_bytes())
        }
        _ => None,
    }
}

/// `body` (which starts at `base` in the container) minus the `hole` range.
fn split_out(body: &[u8], base: u64, hole: Rva) -> [&[u8]; 2] {
    let end = base + body.len() as u64;
    let hole_end = hole.end().unwrap_or(u64::MAX);
    if hole.is_empty() || hole_end <= base || hole.off >= end {
        return [body, &[]];
    }
    let start = hole.off.max(base) - base;
    let stop = hole_end.min(end) - base;
    [&body[..start as usize], &body[stop as usize..]]
}

/// 384-bit resource content hash: SHA-384 for `Sha2`, BLAKE3 XOF otherwise.
pub fn resource_hash(hash_type: HashType, data: &[u8]) -> [u8; 48] {
    let mut out = [0u8; 48];
    match hash_type {
        HashType::Sha2 => out.copy_from_slice(&Sha384::digest(data)),
        _ => {
            let mut hasher = blake3::Hasher::new();
            hasher.update(data);
            hasher.finalize_xof().fill(&mut out);
        }
    }
    out
}

/// Check decoded resource content against its descriptor.
pub fn verify_resource_hash(hash_type: HashType, desc: &ResourceDescriptor, data: &[u8]) -> bool {
    data.len() as u64 == desc.orig_size && resource_hash(hash_type, data) == desc.hash
}

/// Verify the security blob of a container against a set of signer keys.
///
/// `header_bytes` are the `hdr_size` header bytes as stored.
pub fn verify_signature(
    header: &ContainerHeader,
    header_bytes: &[u8],
    container: &[u8],
    signer_keys: &[[u8; 32]],
) -> SignatureStatus {
    if header.crypto_mode == 0 || header.dirs.security.is_empty() {
        return SignatureStatus::Unsigned;
    }
    let blob = match header
        .dirs
        .security
        .slice(container, "security blob")
        .and_then(SecurityBlob::decode)
    {
        Ok(blob) => blob,
        Err(_) => return SignatureStatus::Invalid,
    };
    if blob.header.sig_type != SignatureScheme::Ed25519 {
        return SignatureStatus::UnknownAlgorithm;
    }
    if header.sig_scheme != SignatureScheme::Ed25519.raw() as u16 {
        return SignatureStatus::Invalid;
    }
    if blob.header.key_revocation != 0 {
        log::warn!("[PLAM] signer key is flagged revoked");
        return SignatureStatus::Invalid;
    }
    if !signer_keys.contains(&blob.public_key) {
        log::warn!("[PLAM] signer key {} is not trusted", hex::encode(blob.public_key));
        return SignatureStatus::Invalid;
    }
    let Ok(key) = VerifyingKey::from_bytes(&blob.public_key) else {
        return SignatureStatus::Invalid;
    };
    let signature = Signature::from_bytes(&blob.signature);
    match key.verify(header_bytes, &signature) {
        Ok(()) => SignatureStatus::Valid,
        Err(_) => SignatureStatus::Invalid,
    }
}

/// Hex digest for diagnostics.
pub fn digest_hex(bytes: &[u8]) -> alloc::string::String {
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_sha256_vector() {
        let hash = build_hash(HashType::Sha2, b"abc", 0, Rva::EMPTY).unwrap();
        assert_eq!(
            hex::encode(hash),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_blake3_vector() {
        let hash = build_hash(HashType::Blake3, b"", 0, Rva::EMPTY).unwrap();
        assert_eq!(
            hex::encode(hash),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }

    #[test]
    fn test_build_hash_skips_security() {
        let mut data = alloc::vec![1u8; 64];
        let a = build_hash(HashType::Blake3, &data, 16, Rva::new(32, 8)).unwrap();
        data[35] = 9;
        let b = build_hash(HashType::Blake3, &data, 16, Rva::new(32, 8)).unwrap();
        assert_eq!(a, b);
        data[50] = 9;
        let c = build_hash(HashType::Blake3, &data, 16, Rva::new(32, 8)).unwrap();
        assert_ne!(a, c);
        assert_eq!(build_hash(HashType::None, &data, 16, Rva::EMPTY), None);
    }

    #[test]
    fn test_header_checksum_roundtrip() {
        let mut bytes: Vec<u8> = (0..64u8).collect();
        seal_header(&mut bytes);
        assert!(verify_header_checksum(&bytes));
        bytes[40] ^= 1;
        assert!(!verify_header_checksum(&bytes));
        assert!(!verify_header_checksum(&bytes[..10]));
    }

    #[test]
    fn test_resource_hash_algorithms_differ() {
        let sha = resource_hash(HashType::Sha2, b"icon");
        let b3 = resource_hash(HashType::Blake3, b"icon");
        assert_ne!(sha, b3);
        assert_eq!(b3, resource_hash(HashType::None, b"icon"));
    }
}
