//! Module and Symbol Registries
//!
//! The module registry owns every loaded module in a generation-checked
//! arena; the symbol registry keeps the process-wide name index that imports
//! fall back to. Both live behind reader/writer locks in the loader context.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::arena::{Arena, ArenaId};
use crate::deps::Candidate;
use crate::error::{LoadError, Result};
use crate::loader::LoadedModule;
use crate::symbols::ExportedSymbol;

/// Handle of a loaded module.
pub type ModuleId = ArenaId;

/// Loaded modules by id and by name.
pub struct ModuleRegistry {
    modules: Arena<Arc<LoadedModule>>,
    by_name: HashMap<String, ModuleId>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: Arena::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Id the next inserted module will receive.
    pub fn next_id(&self) -> ModuleId {
        self.modules.next_id()
    }

    pub fn get(&self, id: ModuleId) -> Result<Arc<LoadedModule>> {
        self.modules.get(id).cloned().ok_or(LoadError::StaleHandle)
    }

    pub fn find(&self, name: &str) -> Option<Arc<LoadedModule>> {
        let id = self.by_name.get(name)?;
        self.modules.get(*id).cloned()
    }

    /// What a dependency lookup for `name` sees.
    pub fn candidate(&self, name: &str) -> Option<Candidate<ModuleId>> {
        self.find(name).map(|module| Candidate {
            key: module.id,
            version: module.version,
            uuid: module.uuid,
        })
    }

    pub fn insert(&mut self, module: Arc<LoadedModule>) -> ModuleId {
        let name = module.name.clone();
        let id = self.modules.insert(module);
        self.by_name.insert(name, id);
        id
    }

    /// Swap the module behind `id`, returning the previous one.
    pub fn replace(&mut self, id: ModuleId, module: Arc<LoadedModule>) -> Result<Arc<LoadedModule>> {
        self.modules.replace(id, module).ok_or(LoadError::StaleHandle)
    }

    pub fn remove(&mut self, id: ModuleId) -> Result<Arc<LoadedModule>> {
        let module = self.modules.remove(id).ok_or(LoadError::StaleHandle)?;
        self.by_name.remove(&module.name);
        Ok(module)
    }

    /// Modules that depend strongly on `id`.
    pub fn dependents(&self, id: ModuleId) -> Vec<ModuleId> {
        self.modules
            .iter()
            .filter(|(_, m)| m.dependencies.iter().any(|d| d.module == id && !d.soft))
            .map(|(other, _)| other)
            .collect()
    }

    /// All modules, oldest load first.
    pub fn in_load_order(&self) -> Vec<Arc<LoadedModule>> {
        let mut all: Vec<Arc<LoadedModule>> = self.modules.iter().map(|(_, m)| m.clone()).collect();
        all.sort_by_key(|m| m.sequence);
        all
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Who defined a global symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolOwner {
    Host,
    Module(ModuleId),
}

/// Entry of the process-wide symbol index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalSymbol {
    pub owner: SymbolOwner,
    pub address: u64,
    pub weak: bool,
}

/// Process-wide symbol index. Host symbols come first, then module exports in
/// registration order; the first strong definition of a name wins over any
/// weak one.
#[derive(Default)]
pub struct SymbolRegistry {
    host: Vec<(String, u64)>,
    modules: Vec<(ModuleId, Vec<ExportedSymbol>)>,
    global: HashMap<String, GlobalSymbol>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.global.len()
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty()
    }

    pub fn resolve(&self, name: &str) -> Option<GlobalSymbol> {
        self.global.get(name).copied()
    }

    pub fn register_host(&mut self, name: &str, address: u64) {
        self.host.push((String::from(name), address));
        Self::publish(
            &mut self.global,
            name,
            GlobalSymbol {
                owner: SymbolOwner::Host,
                address,
                weak: false,
            },
        );
    }

    pub fn register_module(&mut self, id: ModuleId, exports: &[ExportedSymbol]) {
        for export in exports {
            Self::publish(&mut self.global, &export.name, Self::entry(id, export));
        }
        self.modules.push((id, exports.to_vec()));
    }

    /// Replace a module's exports in place (hot patch).
    pub fn replace_module(&mut self, id: ModuleId, exports: &[ExportedSymbol]) {
        match self.modules.iter_mut().find(|(owner, _)| *owner == id) {
            Some(slot) => slot.1 = exports.to_vec(),
            None => self.modules.push((id, exports.to_vec())),
        }
        self.rebuild();
    }

    pub fn unregister_module(&mut self, id: ModuleId) {
        let before = self.modules.len();
        self.modules.retain(|(owner, _)| *owner != id);
        if self.modules.len() != before {
            self.rebuild();
        }
    }

    fn entry(id: ModuleId, export: &ExportedSymbol) -> GlobalSymbol {
        GlobalSymbol {
            owner: SymbolOwner::Module(id),
            address: export.address,
            weak: export.is_weak(),
        }
    }

    fn publish(global: &mut HashMap<String, GlobalSymbol>, name: &str, symbol: GlobalSymbol) {
        match global.get_mut(name) {
            None => {
                global.insert(String::from(name), symbol);
            }
            Some(existing) if existing.weak && !symbol.weak => *existing = symbol,
            Some(_) => {
                log::trace!("[PLAM] symbol `{}` already defined, keeping first", name);
            }
        }
    }

    fn rebuild(&mut self) {
        self.global.clear();
        for (name, address) in &self.host {
            Self::publish(
                &mut self.global,
                name,
                GlobalSymbol {
                    owner: SymbolOwner::Host,
                    address: *address,
                    weak: false,
                },
            );
        }
        for (id, exports) in &self.modules {
            for export in exports {
                Self::publish(&mut self.global, &export.name, Self::entry(*id, export));
            }
        }
    }
}
