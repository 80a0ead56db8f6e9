//! Resource Store
//!
//! Descriptors are indexed and blobs copied at load time; decompression and
//! hash verification happen on first access and the decoded bytes are cached
//! for the lifetime of the module.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::codec::{decode_table, Record, Rva};
use crate::compress;
use crate::deps::SemVer;
use crate::error::{LoadError, LoadWarning, Result};
use crate::format::{HashType, ResourceFlags, ResourceType};
use crate::header::ContainerHeader;
use crate::integrity;
use crate::tables::ResourceDescriptor;

/// Resources of one loaded module.
#[derive(Debug)]
pub struct ResourceStore {
    hash_type: HashType,
    descriptors: Vec<ResourceDescriptor>,
    blobs: Vec<Vec<u8>>,
    cache: Mutex<BTreeMap<usize, Arc<[u8]>>>,
}

impl ResourceStore {
    pub fn empty() -> Self {
        Self {
            hash_type: HashType::None,
            descriptors: Vec::new(),
            blobs: Vec::new(),
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Index the descriptor array and copy each stored blob.
    ///
    /// A descriptor with a bad magic or a blob outside the container is fatal;
    /// content problems are only detected on access.
    pub fn index(header: &ContainerHeader, container: &[u8]) -> Result<Self> {
        let count = header.res_cnt;
        if count == 0 {
            return Ok(Self::empty());
        }
        let needed = count as u64 * ResourceDescriptor::SIZE as u64;
        if header.resources.size < needed {
            return Err(LoadError::OutOfBounds { what: "resource table" });
        }
        let descriptors: Vec<ResourceDescriptor> =
            decode_table(container, header.resources.off, count)?;
        let mut blobs = Vec::with_capacity(descriptors.len());
        for desc in &descriptors {
            desc.check_magic()?;
            blobs.push(desc.blob.slice(container, "resource blob")?.to_vec());
        }
        log::debug!("[PLAM] resources: indexed {}", descriptors.len());
        Ok(Self {
            hash_type: header.hash_type,
            descriptors,
            blobs,
            cache: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[ResourceDescriptor] {
        &self.descriptors
    }

    /// Index of the resource for `(res_type, lang)`: exact language first,
    /// then the language-neutral one.
    pub fn find(&self, res_type: ResourceType, lang: &str) -> Option<usize> {
        let of_type = || {
            self.descriptors
                .iter()
                .enumerate()
                .filter(move |(_, d)| d.res_type == res_type)
        };
        of_type()
            .find(|(_, d)| d.language() == lang)
            .or_else(|| of_type().find(|(_, d)| d.language().is_empty()))
            .map(|(i, _)| i)
    }

    /// Decoded and verified bytes of resource `index`.
    pub fn get(&self, index: usize) -> Result<Arc<[u8]>> {
        if let Some(bytes) = self.cache.lock().get(&index) {
            return Ok(bytes.clone());
        }
        let desc = self.descriptors.get(index).ok_or(LoadError::ResourceNotFound)?;
        let blob = &self.blobs[index];
        let data = match compress::decompress(desc.comp_alg, blob, desc.orig_size) {
            Ok(data) => data,
            Err(LoadError::DecompressionFailed) => {
                return Err(LoadError::ResourceCorrupt { index })
            }
            Err(err) => return Err(err),
        };
        if !integrity::verify_resource_hash(self.hash_type, desc, &data) {
            log::warn!("[PLAM] resource {} failed hash check", index);
            return Err(LoadError::ResourceCorrupt { index });
        }
        let bytes: Arc<[u8]> = Arc::from(data);
        self.cache.lock().insert(index, bytes.clone());
        Ok(bytes)
    }

    /// `get_resource(type, language)`.
    pub fn get_resource(&self, res_type: ResourceType, lang: &str) -> Result<Arc<[u8]>> {
        let index = self.find(res_type, lang).ok_or(LoadError::ResourceNotFound)?;
        self.get(index)
    }

    /// Check every resource now. A corrupt `CRITICAL` resource is an error;
    /// anything else becomes a warning.
    pub fn verify_all(&self, warnings: &mut Vec<LoadWarning>) -> Result<()> {
        for (index, desc) in self.descriptors.iter().enumerate() {
            match self.get(index) {
                Ok(_) => {}
                Err(LoadError::ResourceCorrupt { .. })
                    if !desc.flags.contains(ResourceFlags::CRITICAL) =>
                {
                    warnings.push(LoadWarning::CorruptResource { index });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Module version from the language-neutral VERSION resource.
    pub fn version(&self, warnings: &mut Vec<LoadWarning>) -> Option<SemVer> {
        let index = self.find(ResourceType::Version, "")?;
        match self.get(index) {
            Ok(bytes) if bytes.len() >= 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                Some(SemVer::from_packed(u64::from_le_bytes(raw)))
            }
            Ok(_) => None,
            Err(_) => {
                warnings.push(LoadWarning::CorruptResource { index });
                None
            }
        }
    }

    /// Whether resource `index` has already been decoded.
    pub fn is_cached(&self, index: usize) -> bool {
        self.cache.lock().contains_key(&index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{CompressionAlgorithm, CpuId, FileType, PLAM_RES_MAGIC};

    /// Header + descriptor table at 380 + blobs.
    fn container(resources: &[(ResourceType, &str, &[u8], bool)]) -> (ContainerHeader, Vec<u8>) {
        let mut header = ContainerHeader::new(FileType::App, CpuId::X86_64);
        header.hash_type = HashType::Blake3;
        let table_off = 380u64;
        let table_len = resources.len() as u64 * ResourceDescriptor::SIZE as u64;
        let mut blobs = Vec::new();
        let mut table = Vec::new();
        for (ty, lang, data, corrupt) in resources {
            let off = table_off + table_len + blobs.len() as u64;
            let packed = compress::compress(CompressionAlgorithm::Lz4, data).unwrap();
            let mut hash = integrity::resource_hash(HashType::Blake3, data);
            if *corrupt {
                hash[0] ^= 0xFF;
            }
            ResourceDescriptor {
                magic: PLAM_RES_MAGIC,
                res_type: *ty,
                flags: ResourceFlags::empty(),
                blob: Rva::new(off, packed.len() as u64),
                orig_size: data.len() as u64,
                comp_alg: CompressionAlgorithm::Lz4,
                lang: ResourceDescriptor::pack_language(lang),
                hash,
                extra: [0; 6],
            }
            .encode(&mut table);
            blobs.extend_from_slice(&packed);
        }
        header.resources = Rva::new(table_off, table_len);
        header.res_cnt = resources.len() as u32;
        let mut out = header.to_bytes();
        out.extend_from_slice(&table);
        out.extend_from_slice(&blobs);
        (header, out)
    }

    #[test]
    fn test_language_fallback() {
        let (header, file) = container(&[
            (ResourceType::String, "", &b"hello"[..], false),
            (ResourceType::String, "de", &b"hallo"[..], false),
        ]);
        let store = ResourceStore::index(&header, &file).unwrap();
        assert_eq!(&*store.get_resource(ResourceType::String, "de").unwrap(), b"hallo");
        assert_eq!(&*store.get_resource(ResourceType::String, "fr").unwrap(), b"hello");
        assert_eq!(
            store.get_resource(ResourceType::Icon, ""),
            Err(LoadError::ResourceNotFound)
        );
    }

    #[test]
    fn test_lazy_decode_and_cache() {
        let (header, file) = container(&[(ResourceType::Icon, "", &[3u8; 300][..], false)]);
        let store = ResourceStore::index(&header, &file).unwrap();
        assert!(!store.is_cached(0));
        let first = store.get(0).unwrap();
        assert!(store.is_cached(0));
        assert!(Arc::ptr_eq(&first, &store.get(0).unwrap()));
    }

    #[test]
    fn test_corrupt_resource_is_reported() {
        let (header, file) = container(&[
            (ResourceType::Icon, "", &b"good"[..], false),
            (ResourceType::Ui, "", &b"bad"[..], true),
        ]);
        let store = ResourceStore::index(&header, &file).unwrap();
        assert_eq!(store.get(1), Err(LoadError::ResourceCorrupt { index: 1 }));
        assert!(store.get(0).is_ok());
        let mut warnings = Vec::new();
        store.verify_all(&mut warnings).unwrap();
        assert_eq!(warnings, alloc::vec![LoadWarning::CorruptResource { index: 1 }]);
    }

    #[test]
    fn test_bad_descriptor_magic_is_fatal() {
        let (header, mut file) = container(&[(ResourceType::Icon, "", &b"x"[..], false)]);
        file[380] = 0;
        assert!(matches!(
            ResourceStore::index(&header, &file),
            Err(LoadError::MagicMismatch { .. })
        ));
    }

    #[test]
    fn test_version_resource() {
        let packed = SemVer::new(1, 4, 2).packed().to_le_bytes();
        let (header, file) = container(&[(ResourceType::Version, "", &packed[..], false)]);
        let store = ResourceStore::index(&header, &file).unwrap();
        let mut warnings = Vec::new();
        assert_eq!(store.version(&mut warnings), Some(SemVer::new(1, 4, 2)));
    }
}
