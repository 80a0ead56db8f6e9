//! Loader configuration
//!
//! Compile-time limits plus the runtime [`LoadPolicy`] chosen by the caller.

use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::format::{CpuFeatures, CpuId};

/// Default page size used for PIE image reservations.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Upper bound for any single decompressed section, resource or payload.
pub const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024 * 1024;

/// Upper bound for a mapped image span.
pub const MAX_IMAGE_SPAN: u64 = 1024 * 1024 * 1024;

/// Dispatch-table symbol a driver module must export.
pub const DRIVER_DISPATCH_SYMBOL: &str = "__plam_driver_dispatch";

/// CPU the loader is loading for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuRequest {
    pub id: u16,
    #[serde(default)]
    pub features: u16,
}

impl CpuRequest {
    pub const fn new(cpu: CpuId, features: CpuFeatures) -> Self {
        Self {
            id: cpu.raw(),
            features: features.bits(),
        }
    }

    pub fn cpu(&self) -> CpuId {
        CpuId::from_raw(self.id)
    }

    pub fn features(&self) -> CpuFeatures {
        CpuFeatures::from_bits_retain(self.features)
    }
}

impl Default for CpuRequest {
    fn default() -> Self {
        Self::new(CpuId::X86_64, CpuFeatures::empty())
    }
}

/// Policy decisions the loader leaves to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadPolicy {
    pub cpu: CpuRequest,
    /// Refuse anything whose signature is not `Valid`.
    pub require_signature: bool,
    /// Hex-encoded Ed25519 public keys.
    pub trusted_keys: Vec<String>,
    pub verify_build_hash: bool,
    /// Let `ALLOW_WX` containers map write+exec sections.
    pub honor_wx_override: bool,
    /// Check every resource hash at load time instead of on first access.
    pub verify_resources_eagerly: bool,
    pub page_size: u64,
}

impl Default for LoadPolicy {
    fn default() -> Self {
        Self {
            cpu: CpuRequest::default(),
            require_signature: false,
            trusted_keys: Vec::new(),
            verify_build_hash: true,
            honor_wx_override: true,
            verify_resources_eagerly: false,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl LoadPolicy {
    pub fn for_cpu(cpu: CpuId, features: CpuFeatures) -> Self {
        Self {
            cpu: CpuRequest::new(cpu, features),
            ..Self::default()
        }
    }

    /// Decoded trusted keys. Malformed entries are skipped.
    pub fn trusted_key_bytes(&self) -> Vec<[u8; 32]> {
        let mut keys = Vec::with_capacity(self.trusted_keys.len());
        for key in &self.trusted_keys {
            let mut raw = [0u8; 32];
            match hex::decode_to_slice(key.trim(), &mut raw) {
                Ok(()) => keys.push(raw),
                Err(_) => log::warn!("[PLAM] ignoring malformed trusted key {}", key),
            }
        }
        keys
    }

    /// Page size, falling back to the default when unset or not a power of two.
    pub fn effective_page_size(&self) -> u64 {
        if self.page_size.is_power_of_two() {
            self.page_size
        } else {
            DEFAULT_PAGE_SIZE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = LoadPolicy::default();
        assert_eq!(policy.cpu.cpu(), CpuId::X86_64);
        assert!(!policy.require_signature);
        assert!(policy.verify_build_hash);
        assert_eq!(policy.effective_page_size(), 4096);
    }

    #[test]
    fn test_trusted_keys_skip_malformed() {
        let mut policy = LoadPolicy::default();
        policy.trusted_keys.push(String::from("zz"));
        policy.trusted_keys.push(hex::encode([0x11u8; 32]));
        assert_eq!(policy.trusted_key_bytes(), alloc::vec![[0x11u8; 32]]);
    }

    #[test]
    fn test_bad_page_size_falls_back() {
        let policy = LoadPolicy {
            page_size: 3000,
            ..LoadPolicy::default()
        };
        assert_eq!(policy.effective_page_size(), DEFAULT_PAGE_SIZE);
    }
}
