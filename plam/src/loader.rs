//! Loader context
//!
//! Created once at startup and passed to every operation. It owns the module
//! and symbol registries (each behind a reader/writer lock), the address-space
//! collaborator and the driver catalog.
//!
//! A load runs in two phases. `prepare` parses and validates the container
//! and builds the section image without touching shared state. `link` then
//! takes the registry lock, resolves dependencies and symbols, relocates the
//! image in memory, commits it to the address space and publishes the module.
//! Any failure before publication unmaps whatever was committed and gives the
//! reservation back.
//!
//! An image that leaves the registry (unload, or replacement by a hot patch)
//! stays mapped while any other image's imports are bound into it.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard, RwLock};

use crate::config::{LoadPolicy, DRIVER_DISPATCH_SYMBOL};
use crate::container::Container;
use crate::deps::{self, BatchNode, DependencySpec, ResolvedDependency, SemVer};
use crate::driver::{BoundDriver, DriverCatalog, DriverFactory};
use crate::error::{LoadError, LoadWarning, Result};
use crate::format::{CpuId, FileType, HeaderFlags};
use crate::header::ContainerHeader;
use crate::integrity::SignatureStatus;
use crate::mapper::{self, Image};
use crate::registry::{GlobalSymbol, ModuleId, ModuleRegistry, SymbolOwner, SymbolRegistry};
use crate::reloc;
use crate::resources::ResourceStore;
use crate::space::{AddressSpace, Protection, Reservation};
use crate::symbols::{self, ExportedSymbol, SymbolTable};
use crate::tables::{ManifestExt, Relocation, UnwindEntry};

/// A container to load under a module name.
#[derive(Debug, Clone, Copy)]
pub struct LoadRequest<'a> {
    pub name: &'a str,
    pub bytes: &'a [u8],
}

impl<'a> LoadRequest<'a> {
    pub fn new(name: &'a str, bytes: &'a [u8]) -> Self {
        Self { name, bytes }
    }
}

/// A section as committed to the address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedSection {
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub protection: Protection,
}

/// A module that is mapped, relocated and registered.
#[derive(Debug)]
pub struct LoadedModule {
    pub id: ModuleId,
    pub name: String,
    pub version: SemVer,
    pub uuid: [u8; 16],
    pub file_type: FileType,
    pub cpu: CpuId,
    pub flags: HeaderFlags,
    /// Image base; section addresses are `base + rva`.
    pub base: u64,
    /// Address-space range backing a PIE image.
    pub reservation: Option<Reservation>,
    pub entry_rva: Option<u64>,
    pub sections: Vec<MappedSection>,
    pub exports: Vec<ExportedSymbol>,
    pub dependencies: Vec<ResolvedDependency<ModuleId>>,
    pub relocations_applied: usize,
    pub resources: ResourceStore,
    pub signature: SignatureStatus,
    pub warnings: Vec<LoadWarning>,
    pub unwind: Vec<UnwindEntry>,
    pub manifest: Option<ManifestExt>,
    /// Load order; kept across a hot patch.
    pub sequence: u64,
    /// Unique per linked image. A hot patch keeps the id but not the serial.
    pub image_serial: u64,
    /// Serials of the images this one's imports were bound into.
    pub bound_to: Vec<u64>,
}

impl LoadedModule {
    /// Absolute entry address.
    pub fn entry(&self) -> Option<u64> {
        self.entry_rva.map(|rva| self.base.wrapping_add(rva))
    }

    pub fn export(&self, name: &str) -> Option<&ExportedSymbol> {
        self.exports.iter().find(|e| e.name == name)
    }

    pub fn section_containing(&self, address: u64) -> Option<&MappedSection> {
        self.sections
            .iter()
            .find(|s| address >= s.address && address - s.address < s.size)
    }

    pub fn is_hot_patchable(&self) -> bool {
        self.flags.contains(HeaderFlags::HOT_PATCHABLE)
    }
}

/// Container validated and imaged, waiting to be linked.
struct Prepared {
    name: String,
    header: ContainerHeader,
    image: Image,
    entry_rva: Option<u64>,
    symbols: SymbolTable,
    exports: Vec<u32>,
    relocations: Vec<Relocation>,
    dependencies: Vec<DependencySpec>,
    resources: ResourceStore,
    version: SemVer,
    signature: SignatureStatus,
    warnings: Vec<LoadWarning>,
    unwind: Vec<UnwindEntry>,
    manifest: Option<ManifestExt>,
}

/// What a successful `link` changed.
enum Linked {
    Loaded(ModuleId),
    /// Hot patch. The replaced image is still mapped.
    Patched(ModuleId, Arc<LoadedModule>),
}

impl Linked {
    fn id(&self) -> ModuleId {
        match self {
            Linked::Loaded(id) | Linked::Patched(id, _) => *id,
        }
    }
}

/// An image out of the registry that other images still hold addresses in.
struct RetiredImage {
    image: Arc<LoadedModule>,
    /// Serials of the images bound into it.
    pinned_by: Vec<u64>,
}

/// Explicit loader state.
pub struct LoaderContext<S: AddressSpace> {
    policy: LoadPolicy,
    modules: RwLock<ModuleRegistry>,
    symbols: RwLock<SymbolRegistry>,
    retired: Mutex<Vec<RetiredImage>>,
    space: Mutex<S>,
    drivers: RwLock<DriverCatalog>,
    sequence: AtomicU64,
    images: AtomicU64,
}

impl<S: AddressSpace> LoaderContext<S> {
    pub fn new(policy: LoadPolicy, space: S) -> Self {
        log::info!(
            "[PLAM] loader context for {} (signatures {})",
            policy.cpu.cpu().name(),
            if policy.require_signature { "required" } else { "optional" }
        );
        Self {
            policy,
            modules: RwLock::new(ModuleRegistry::new()),
            symbols: RwLock::new(SymbolRegistry::new()),
            retired: Mutex::new(Vec::new()),
            space: Mutex::new(space),
            drivers: RwLock::new(DriverCatalog::new()),
            sequence: AtomicU64::new(0),
            images: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &LoadPolicy {
        &self.policy
    }

    /// Exclusive access to the address-space collaborator.
    pub fn address_space(&self) -> MutexGuard<'_, S> {
        self.space.lock()
    }

    pub fn register_driver(&self, name: &str, factory: DriverFactory) {
        self.drivers.write().register(name, factory);
    }

    pub fn register_host_symbol(&self, name: &str, address: u64) {
        self.symbols.write().register_host(name, address);
    }

    pub fn module(&self, id: ModuleId) -> Result<Arc<LoadedModule>> {
        self.modules.read().get(id)
    }

    pub fn find_module(&self, name: &str) -> Option<Arc<LoadedModule>> {
        self.modules.read().find(name)
    }

    /// Loaded modules, oldest first.
    pub fn modules(&self) -> Vec<Arc<LoadedModule>> {
        self.modules.read().in_load_order()
    }

    /// Replaced or unloaded images kept mapped for the images bound into them.
    pub fn retired_images(&self) -> usize {
        self.retired.lock().len()
    }

    /// `dlsym`: address of `name` as exported by module `id`.
    pub fn lookup_symbol(&self, id: ModuleId, name: &str) -> Result<u64> {
        let module = self.module(id)?;
        module
            .export(name)
            .map(|e| e.address)
            .ok_or_else(|| LoadError::UnresolvedSymbol(String::from(name)))
    }

    /// Process-wide lookup.
    pub fn resolve_symbol(&self, name: &str) -> Option<GlobalSymbol> {
        self.symbols.read().resolve(name)
    }

    /// Load one container.
    pub fn load(&self, request: LoadRequest<'_>) -> Result<ModuleId> {
        let prepared = self.prepare(request)?;
        let linked = self.link(prepared)?;
        let id = linked.id();
        self.settle(linked);
        Ok(id)
    }

    /// Load several containers, dependencies first. Either all of them end up
    /// loaded or none do; a module the batch hot-patched gets its previous
    /// image back.
    pub fn load_batch(&self, requests: &[LoadRequest<'_>]) -> Result<Vec<ModuleId>> {
        let mut prepared = Vec::with_capacity(requests.len());
        for request in requests {
            prepared.push(Some(self.prepare(*request)?));
        }
        let order = {
            let nodes: Vec<BatchNode<'_>> = prepared
                .iter()
                .flatten()
                .map(|p| BatchNode {
                    name: &p.name,
                    deps: &p.dependencies,
                })
                .collect();
            deps::load_order(&nodes)?
        };

        let mut ids: Vec<Option<ModuleId>> = alloc::vec![None; requests.len()];
        let mut done: Vec<Linked> = Vec::with_capacity(requests.len());
        for index in order {
            let Some(module) = prepared[index].take() else {
                continue;
            };
            match self.link(module) {
                Ok(linked) => {
                    ids[index] = Some(linked.id());
                    done.push(linked);
                }
                Err(err) => {
                    log::warn!("[PLAM] batch load failed ({}), rolling back", err);
                    self.roll_back(done);
                    return Err(err);
                }
            }
        }
        for linked in done {
            self.settle(linked);
        }
        Ok(ids.into_iter().flatten().collect())
    }

    /// Undo batch steps, newest first.
    fn roll_back(&self, done: Vec<Linked>) {
        for linked in done.into_iter().rev() {
            let id = linked.id();
            let undone = match linked {
                Linked::Loaded(id) => self.unload(id),
                Linked::Patched(id, previous) => self.restore(id, previous),
            };
            if let Err(err) = undone {
                log::error!("[PLAM] rollback of {} failed: {}", id, err);
            }
        }
    }

    /// Put a hot-patched module's previous image back in its slot.
    fn restore(&self, id: ModuleId, previous: Arc<LoadedModule>) -> Result<()> {
        let mut registry = self.modules.write();
        let patched = registry.replace(id, previous.clone())?;
        self.symbols.write().replace_module(id, &previous.exports);
        log::info!(
            "[PLAM] restored `{}` {} over {}",
            previous.name,
            previous.version,
            patched.version
        );
        self.retire(&registry, patched);
        Ok(())
    }

    /// Retire the image a hot patch replaced.
    fn settle(&self, linked: Linked) {
        if let Linked::Patched(_, previous) = linked {
            let registry = self.modules.read();
            self.retire(&registry, previous);
        }
    }

    /// Parse, verify and image a container. Touches no shared state.
    fn prepare(&self, request: LoadRequest<'_>) -> Result<Prepared> {
        let container = Container::open(request.bytes, &self.policy)?;
        let header = container.header().clone();
        self.check_arch(&header)?;

        let mut warnings = container.warnings().to_vec();
        let bytes = container.bytes();
        let allow_wx =
            header.flags.contains(HeaderFlags::ALLOW_WX) && self.policy.honor_wx_override;
        let image = mapper::build_image(&container.sections()?, bytes, container.strings()?, allow_wx)?;
        let entry_rva = mapper::validate_entry(&header, &image)?;

        let symbols = container.symbols()?;
        let exports = symbols.export_indices(&header, bytes)?;
        let relocations = container.relocations()?;

        let resources = ResourceStore::index(&header, bytes)?;
        if self.policy.verify_resources_eagerly {
            resources.verify_all(&mut warnings)?;
        }
        let version = resources.version(&mut warnings).unwrap_or_default();

        Ok(Prepared {
            name: String::from(request.name),
            image,
            entry_rva,
            symbols,
            exports,
            relocations,
            dependencies: container.dependencies()?,
            resources,
            version,
            signature: container.signature(),
            warnings,
            unwind: container.unwind()?,
            manifest: container.manifest()?,
            header,
        })
    }

    /// A thin container must target the requesting CPU family and may only
    /// need features the requester has.
    fn check_arch(&self, header: &ContainerHeader) -> Result<()> {
        let request = self.policy.cpu;
        if header.cpu_id == CpuId::None {
            return Ok(());
        }
        let family_ok = header.cpu_id.family() == request.cpu().family();
        if !family_ok || !request.features().contains(header.cpu_sub) {
            return Err(LoadError::ArchNotSupported {
                cpu_id: header.cpu_id.raw(),
            });
        }
        Ok(())
    }

    fn link(&self, mut prepared: Prepared) -> Result<Linked> {
        let mut registry = self.modules.write();

        let existing = registry.find(&prepared.name);
        if existing.is_some() {
            if !prepared.header.flags.contains(HeaderFlags::HOT_PATCHABLE) {
                return Err(LoadError::AlreadyLoaded(prepared.name));
            }
            // The replacement is mapped beside the running image.
            if !prepared.header.flags.contains(HeaderFlags::PIE) {
                log::warn!("[PLAM] `{}`: hot patch image is not PIE", prepared.name);
                return Err(LoadError::NotRelocatable(prepared.name));
            }
        }

        let dependencies = deps::resolve_dependencies(
            &prepared.dependencies,
            |name| registry.candidate(name),
            &mut prepared.warnings,
        )?;

        // Lock order: modules, symbols, retired images, address space.
        let globals = self.symbols.read();
        let mut space = self.space.lock();
        let (base, reservation) = self.place(&mut *space, &prepared)?;

        let mut bound_to: Vec<u64> = Vec::new();
        let import = |name: &str| {
            let (provider, address) = dependencies
                .iter()
                .filter_map(|d| registry.get(d.module).ok())
                .find_map(|m| m.export(name).map(|e| (Some(m.image_serial), e.address)))
                .or_else(|| {
                    let global = globals.resolve(name)?;
                    let provider = match global.owner {
                        SymbolOwner::Module(owner) => {
                            registry.get(owner).ok().map(|m| m.image_serial)
                        }
                        SymbolOwner::Host => None,
                    };
                    Some((provider, global.address))
                })?;
            if let Some(serial) = provider {
                if !bound_to.contains(&serial) {
                    bound_to.push(serial);
                }
            }
            Some(address)
        };
        let (sections, exports, relocations_applied) =
            match relocate_and_commit(&mut *space, &mut prepared, base, import) {
                Ok(committed) => committed,
                Err(err) => {
                    if let Some(range) = reservation {
                        space.release(range.base, range.size);
                    }
                    return Err(err);
                }
            };
        drop(space);
        drop(globals);

        let sequence = match &existing {
            Some(old) => old.sequence,
            None => self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        let id = existing.as_ref().map(|m| m.id).unwrap_or_else(|| registry.next_id());
        let module = LoadedModule {
            id,
            name: prepared.name,
            version: prepared.version,
            uuid: prepared.header.uuid,
            file_type: prepared.header.file_type,
            cpu: prepared.header.cpu_id,
            flags: prepared.header.flags,
            base,
            reservation,
            entry_rva: prepared.entry_rva,
            sections,
            exports,
            dependencies,
            relocations_applied,
            resources: prepared.resources,
            signature: prepared.signature,
            warnings: prepared.warnings,
            unwind: prepared.unwind,
            manifest: prepared.manifest,
            sequence,
            image_serial: self.images.fetch_add(1, Ordering::Relaxed),
            bound_to,
        };
        for warning in &module.warnings {
            log::warn!("[PLAM] {}: {}", module.name, warning);
        }

        let module = Arc::new(module);
        match existing {
            Some(old) => {
                if let Err(err) = registry.replace(id, module.clone()) {
                    drop(registry);
                    self.unmap_image(&module);
                    return Err(err);
                }
                self.symbols.write().replace_module(id, &module.exports);
                log::info!(
                    "[PLAM] hot-patched `{}` {} -> {} at {:#x}",
                    module.name,
                    old.version,
                    module.version,
                    module.base
                );
                Ok(Linked::Patched(id, old))
            }
            None => {
                let inserted = registry.insert(module.clone());
                debug_assert_eq!(inserted, id);
                self.symbols.write().register_module(id, &module.exports);
                log::info!(
                    "[PLAM] loaded `{}` {} as {} at {:#x} ({} relocations)",
                    module.name,
                    module.version,
                    id,
                    module.base,
                    module.relocations_applied
                );
                Ok(Linked::Loaded(id))
            }
        }
    }

    /// Choose the image base. PIE images get a fresh reservation; others load
    /// at their link addresses.
    fn place(&self, space: &mut S, prepared: &Prepared) -> Result<(u64, Option<Reservation>)> {
        let image = &prepared.image;
        if !prepared.header.flags.contains(HeaderFlags::PIE) || image.sections.is_empty() {
            return Ok((0, None));
        }
        let page = self.policy.effective_page_size();
        let start = image.min_rva() & !(page - 1);
        let span = (image.min_rva() - start + image.span()).next_multiple_of(page);
        let reserved = space.reserve(None, span, page)?;
        let reservation = Reservation {
            base: reserved,
            size: span,
        };
        Ok((reserved.wrapping_sub(start), Some(reservation)))
    }

    /// Unload a module nobody depends on strongly.
    pub fn unload(&self, id: ModuleId) -> Result<()> {
        let mut registry = self.modules.write();
        let module = registry.get(id)?;
        if let Some(user) = registry.dependents(id).first() {
            let user = registry.get(*user)?;
            log::warn!("[PLAM] `{}` still used by `{}`", module.name, user.name);
            return Err(LoadError::InUse(module.name.clone()));
        }
        self.release_module(&mut registry, id)
    }

    fn release_module(&self, registry: &mut ModuleRegistry, id: ModuleId) -> Result<()> {
        let module = registry.remove(id)?;
        self.symbols.write().unregister_module(id);
        log::info!("[PLAM] unloaded `{}`", module.name);
        self.retire(registry, module);
        Ok(())
    }

    /// Unmap an image that left the registry, or park it while other images
    /// are still bound into it.
    fn retire(&self, registry: &ModuleRegistry, image: Arc<LoadedModule>) {
        let serial = image.image_serial;
        let mut retired = self.retired.lock();
        let mut pinned_by: Vec<u64> = registry
            .in_load_order()
            .iter()
            .filter(|m| m.bound_to.contains(&serial))
            .map(|m| m.image_serial)
            .collect();
        pinned_by.extend(
            retired
                .iter()
                .filter(|r| r.image.bound_to.contains(&serial))
                .map(|r| r.image.image_serial),
        );
        if pinned_by.is_empty() {
            drop(retired);
            self.discard(&image);
            return;
        }
        log::debug!(
            "[PLAM] keeping `{}` {} mapped for {} bound images",
            image.name,
            image.version,
            pinned_by.len()
        );
        retired.push(RetiredImage { image, pinned_by });
    }

    /// Unmap `image`, then every retired image that was only waiting on it.
    fn discard(&self, image: &LoadedModule) {
        self.unmap_image(image);
        let mut gone = alloc::vec![image.image_serial];
        while let Some(serial) = gone.pop() {
            let freed: Vec<RetiredImage> = {
                let mut retired = self.retired.lock();
                for entry in retired.iter_mut() {
                    entry.pinned_by.retain(|s| *s != serial);
                }
                let (freed, kept) = core::mem::take(&mut *retired)
                    .into_iter()
                    .partition(|entry| entry.pinned_by.is_empty());
                *retired = kept;
                freed
            };
            for entry in freed {
                self.unmap_image(&entry.image);
                gone.push(entry.image.image_serial);
            }
        }
    }

    fn unmap_image(&self, image: &LoadedModule) {
        let mut space = self.space.lock();
        release(&mut *space, &image.sections);
        if let Some(range) = image.reservation {
            space.release(range.base, range.size);
        }
        log::debug!("[PLAM] unmapped image {} of `{}`", image.image_serial, image.name);
    }

    /// Bind the driver implementation named after a loaded driver module.
    pub fn bind_driver(&self, name: &str) -> Result<BoundDriver> {
        let module = self
            .find_module(name)
            .ok_or_else(|| LoadError::ModuleNotFound(String::from(name)))?;
        let table = module
            .export(DRIVER_DISPATCH_SYMBOL)
            .ok_or_else(|| LoadError::UnresolvedSymbol(String::from(DRIVER_DISPATCH_SYMBOL)))?
            .address;
        let driver = self.drivers.read().instantiate(name)?;
        BoundDriver::bind(module.id, table, driver)
    }

    /// Unload everything, most recent first. Returns how many modules were
    /// released.
    pub fn shutdown(&self) -> usize {
        let mut registry = self.modules.write();
        let modules = registry.in_load_order();
        let mut released = 0;
        for module in modules.iter().rev() {
            if self.release_module(&mut registry, module.id).is_ok() {
                released += 1;
            }
        }
        let leftover = core::mem::take(&mut *self.retired.lock());
        for entry in &leftover {
            self.unmap_image(&entry.image);
        }
        log::info!(
            "[PLAM] shutdown released {} modules ({} retired images)",
            released,
            leftover.len()
        );
        released
    }
}

/// Bind symbols, relocate the in-memory image and commit it at `base`.
fn relocate_and_commit<S, F>(
    space: &mut S,
    prepared: &mut Prepared,
    base: u64,
    import: F,
) -> Result<(Vec<MappedSection>, Vec<ExportedSymbol>, usize)>
where
    S: AddressSpace,
    F: FnMut(&str) -> Option<u64>,
{
    let values = symbols::resolve(&prepared.symbols, base, import, &mut prepared.warnings)?;
    let applied =
        reloc::apply_relocations(&mut prepared.image, base, &prepared.relocations, &values)?;
    let exports = symbols::exports(&prepared.symbols, &prepared.exports, &values);
    let sections = commit(space, &prepared.image, base)?;
    Ok((sections, exports, applied))
}

/// Map every section; on failure unmap what was already mapped.
fn commit<S: AddressSpace>(space: &mut S, image: &Image, base: u64) -> Result<Vec<MappedSection>> {
    let mut mapped: Vec<MappedSection> = Vec::with_capacity(image.sections.len());
    for section in &image.sections {
        let request = section.request(base);
        if let Err(err) = space.map(&request) {
            log::warn!(
                "[PLAM] mapping `{}` at {:#x} failed, unmapping {} sections",
                section.name,
                request.address,
                mapped.len()
            );
            release(space, &mapped);
            return Err(err);
        }
        mapped.push(MappedSection {
            name: section.name.clone(),
            address: request.address,
            size: request.size(),
            protection: request.protection,
        });
    }
    Ok(mapped)
}

fn release<S: AddressSpace>(space: &mut S, sections: &[MappedSection]) {
    for section in sections.iter().rev() {
        space.unmap(section.address, section.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{DependencyFlags, RelocType, SymbolBinding};
    use crate::space::InMemoryAddressSpace;
    use crate::writer::{ContainerBuilder, SectionSpec, SymbolSpec};

    fn context() -> LoaderContext<InMemoryAddressSpace> {
        LoaderContext::new(LoadPolicy::default(), InMemoryAddressSpace::new())
    }

    fn library(name: &str, deps: &[(&str, DependencyFlags)]) -> Vec<u8> {
        let mut b = ContainerBuilder::new(FileType::SharedLib, CpuId::X86_64);
        b.flags(HeaderFlags::PIE);
        let text = b.add_section(SectionSpec::code(".text", 0x1000, alloc::vec![0xC3; 8]));
        b.add_symbol(SymbolSpec::function(name, text, 0x1000));
        for (dep, flags) in deps {
            b.add_dependency(DependencySpec {
                name: String::from(*dep),
                version: SemVer::new(0, 0, 0),
                uuid: [0; 16],
                flags: *flags,
            });
        }
        b.build().unwrap()
    }

    #[test]
    fn test_import_resolved_from_dependency() {
        let ctx = context();
        let libc = ctx.load(LoadRequest::new("libc", &library("puts", &[]))).unwrap();
        let puts = ctx.lookup_symbol(libc, "puts").unwrap();

        let mut app = ContainerBuilder::new(FileType::App, CpuId::X86_64);
        app.flags(HeaderFlags::PIE).entry(0x1000);
        app.add_section(SectionSpec::code(".text", 0x1000, alloc::vec![0x90; 16]));
        app.add_section(SectionSpec::data(".data", 0x2000, alloc::vec![0; 8]));
        let import = app.add_symbol(SymbolSpec::import("puts"));
        app.add_relocation(0x2000, RelocType::Abs64, import, 0);
        app.add_dependency(DependencySpec {
            name: String::from("libc"),
            version: SemVer::new(0, 0, 0),
            uuid: [0; 16],
            flags: DependencyFlags::empty(),
        });
        let id = ctx.load(LoadRequest::new("app", &app.build().unwrap())).unwrap();

        let module = ctx.module(id).unwrap();
        assert_eq!(module.relocations_applied, 1);
        assert_eq!(module.dependencies[0].module, libc);
        let slot = module.base + 0x2000;
        let space = ctx.address_space();
        assert_eq!(space.read(slot, 8).unwrap(), &puts.to_le_bytes());
    }

    #[test]
    fn test_unload_in_use_then_release() {
        let ctx = context();
        let base = ctx.load(LoadRequest::new("base", &library("b", &[]))).unwrap();
        let user = ctx
            .load(LoadRequest::new("user", &library("u", &[("base", DependencyFlags::empty())])))
            .unwrap();
        assert_eq!(ctx.unload(base), Err(LoadError::InUse(String::from("base"))));
        ctx.unload(user).unwrap();
        ctx.unload(base).unwrap();
        assert_eq!(ctx.module(base).unwrap_err(), LoadError::StaleHandle);
        assert_eq!(ctx.address_space().region_count(), 0);
        assert_eq!(ctx.address_space().reservation_count(), 0);
        assert!(ctx.resolve_symbol("b").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let ctx = context();
        let bytes = library("f", &[]);
        ctx.load(LoadRequest::new("dup", &bytes)).unwrap();
        assert_eq!(
            ctx.load(LoadRequest::new("dup", &bytes)).unwrap_err(),
            LoadError::AlreadyLoaded(String::from("dup"))
        );
    }

    #[test]
    fn test_unresolved_strong_import_leaves_no_mapping() {
        let ctx = context();
        let mut b = ContainerBuilder::new(FileType::SharedLib, CpuId::X86_64);
        b.flags(HeaderFlags::PIE);
        b.add_section(SectionSpec::code(".text", 0x1000, alloc::vec![0; 8]));
        b.add_symbol(SymbolSpec::import("missing"));
        let err = ctx.load(LoadRequest::new("lib", &b.build().unwrap())).unwrap_err();
        assert_eq!(err, LoadError::UnresolvedSymbol(String::from("missing")));
        assert_eq!(ctx.address_space().region_count(), 0);
        assert_eq!(ctx.address_space().reservation_count(), 0);
        assert!(ctx.modules().is_empty());
    }

    #[test]
    fn test_non_pie_hot_patch_rejected() {
        let ctx = context();
        let build = |fill: u8| {
            let mut b = ContainerBuilder::new(FileType::HotPlugModule, CpuId::X86_64);
            b.flags(HeaderFlags::HOT_PATCHABLE);
            let text = b.add_section(SectionSpec::code(".text", 0x1000, alloc::vec![fill; 8]));
            b.add_symbol(SymbolSpec::function("tick", text, 0x1000));
            b.entry(0x1000);
            b.build().unwrap()
        };
        let id = ctx.load(LoadRequest::new("svc", &build(0xAA))).unwrap();
        assert_eq!(
            ctx.load(LoadRequest::new("svc", &build(0xBB))).unwrap_err(),
            LoadError::NotRelocatable(String::from("svc"))
        );
        let module = ctx.module(id).unwrap();
        assert_eq!(module.base, 0);
        assert_eq!(ctx.address_space().read(0x1000, 8).unwrap(), &[0xAA; 8]);
        assert_eq!(ctx.retired_images(), 0);
    }

    #[test]
    fn test_failed_relocation_returns_reservation() {
        let ctx = context();
        ctx.register_host_symbol("far_away", 0xFFFF_8000_0000_0000);
        let mut b = ContainerBuilder::new(FileType::SharedLib, CpuId::X86_64);
        b.flags(HeaderFlags::PIE);
        b.add_section(SectionSpec::code(".text", 0x1000, alloc::vec![0xC3; 8]));
        let import = b.add_symbol(SymbolSpec::import("far_away"));
        b.add_relocation(0x1000, RelocType::Pc32, import, 0);
        assert_eq!(
            ctx.load(LoadRequest::new("near", &b.build().unwrap())).unwrap_err(),
            LoadError::RelocationOverflow { offset: 0x1000 }
        );
        assert_eq!(ctx.address_space().reservation_count(), 0);
        assert_eq!(ctx.address_space().region_count(), 0);
    }

    #[test]
    fn test_weak_import_bound_to_zero() {
        let ctx = context();
        let mut b = ContainerBuilder::new(FileType::SharedLib, CpuId::X86_64);
        b.add_section(SectionSpec::data(".data", 0x3000, alloc::vec![0xFF; 8]));
        let weak = b.add_symbol(SymbolSpec::import("opt").with_binding(SymbolBinding::Weak));
        b.add_relocation(0x3000, RelocType::Abs64, weak, 0);
        let id = ctx.load(LoadRequest::new("lib", &b.build().unwrap())).unwrap();
        let module = ctx.module(id).unwrap();
        assert_eq!(module.base, 0);
        assert_eq!(
            module.warnings,
            alloc::vec![LoadWarning::UnresolvedWeakSymbol(String::from("opt"))]
        );
        assert_eq!(ctx.address_space().read(0x3000, 8).unwrap(), &[0u8; 8]);
    }

    #[test]
    fn test_host_symbol_satisfies_import() {
        let ctx = context();
        ctx.register_host_symbol("kprint", 0xFFFF_8000_0000_0040);
        let mut b = ContainerBuilder::new(FileType::Driver, CpuId::X86_64);
        b.add_section(SectionSpec::data(".data", 0x5000, alloc::vec![0; 8]));
        let sym = b.add_symbol(SymbolSpec::import("kprint"));
        b.add_relocation(0x5000, RelocType::Abs64, sym, 8);
        ctx.load(LoadRequest::new("drv", &b.build().unwrap())).unwrap();
        assert_eq!(
            ctx.address_space().read(0x5000, 8).unwrap(),
            &0xFFFF_8000_0000_0048u64.to_le_bytes()
        );
    }

    #[test]
    fn test_wrong_architecture() {
        let ctx = context();
        let mut b = ContainerBuilder::new(FileType::SharedLib, CpuId::Arm64);
        b.add_section(SectionSpec::code(".text", 0x1000, alloc::vec![0; 4]));
        assert_eq!(
            ctx.load(LoadRequest::new("arm", &b.build().unwrap())).unwrap_err(),
            LoadError::ArchNotSupported { cpu_id: 0xAA64 }
        );
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let ctx = context();
        ctx.load(LoadRequest::new("base", &library("b", &[]))).unwrap();
        ctx.load(LoadRequest::new("user", &library("u", &[("base", DependencyFlags::empty())])))
            .unwrap();
        assert_eq!(ctx.shutdown(), 2);
        assert!(ctx.modules().is_empty());
        assert_eq!(ctx.address_space().region_count(), 0);
    }
}
