//! Symbol Resolution
//!
//! Decodes a container's symbol table, binds imports against the symbols the
//! dependency resolver and the host make available, and computes the export
//! set published once the module is registered.

use alloc::string::String;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::codec::decode_table;
use crate::error::{LoadError, LoadWarning, Result};
use crate::format::{SymbolBinding, SymbolType};
use crate::header::ContainerHeader;
use crate::tables::{decode_exports, StringTable, Symbol};

/// Symbol entry with its name resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub name: String,
    pub raw: Symbol,
}

/// A container's own symbol table, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    entries: Vec<SymbolEntry>,
    defined: HashMap<String, usize>,
}

impl SymbolTable {
    pub fn decode(header: &ContainerHeader, container: &[u8], strings: StringTable<'_>) -> Result<Self> {
        let raw: Vec<Symbol> =
            decode_table(container, header.symbol_table_off, header.symbol_count)?;
        let mut entries = Vec::with_capacity(raw.len());
        let mut defined = HashMap::new();
        for (index, sym) in raw.into_iter().enumerate() {
            let name = strings.get_owned(sym.name_off)?;
            if !sym.is_undefined() && !name.is_empty() {
                // First definition of a name is the one looked up locally.
                defined.entry(name.clone()).or_insert(index);
            }
            entries.push(SymbolEntry { name, raw: sym });
        }
        Ok(Self { entries, defined })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&SymbolEntry> {
        self.entries.get(index as usize)
    }

    pub fn entries(&self) -> &[SymbolEntry] {
        &self.entries
    }

    /// Index of the local definition of `name`.
    pub fn find_defined(&self, name: &str) -> Option<usize> {
        self.defined.get(name).copied()
    }

    /// Undefined entries, i.e. what this module needs from elsewhere.
    pub fn imports(&self) -> impl Iterator<Item = &SymbolEntry> {
        self.entries.iter().filter(|e| e.raw.is_undefined())
    }

    /// Symbol indices this module publishes: the export table if present,
    /// otherwise every defined global or weak symbol.
    pub fn export_indices(&self, header: &ContainerHeader, container: &[u8]) -> Result<Vec<u32>> {
        if header.export_off == 0 {
            return Ok(self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.raw.is_undefined() && e.raw.is_external() && !e.name.is_empty())
                .map(|(i, _)| i as u32)
                .collect());
        }
        let indices = decode_exports(container, header.export_off)?;
        for &idx in &indices {
            match self.get(idx) {
                Some(entry) if !entry.raw.is_undefined() => {}
                _ => return Err(LoadError::InvalidSymbolIndex(idx)),
            }
        }
        Ok(indices)
    }
}

/// A symbol published by a loaded module (or the host).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedSymbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub sym_type: SymbolType,
    pub binding: SymbolBinding,
}

impl ExportedSymbol {
    pub fn is_weak(&self) -> bool {
        self.binding == SymbolBinding::Weak
    }
}

/// Absolute value of a defined symbol for an image placed at `base`.
fn defined_value(sym: &Symbol, base: u64) -> u64 {
    if sym.is_absolute() {
        sym.value
    } else {
        base.wrapping_add(sym.value)
    }
}

/// Resolve every symbol to an absolute value.
///
/// Defined symbols are rebased; imports go through `import` (dependencies in
/// order, then the global registry). A strong import that stays unresolved
/// fails the load; a weak one is bound to zero and reported.
pub fn resolve<F>(
    table: &SymbolTable,
    base: u64,
    mut import: F,
    warnings: &mut Vec<LoadWarning>,
) -> Result<Vec<u64>>
where
    F: FnMut(&str) -> Option<u64>,
{
    let mut values = Vec::with_capacity(table.len());
    for entry in table.entries() {
        let sym = &entry.raw;
        if !sym.is_undefined() {
            values.push(defined_value(sym, base));
            continue;
        }
        if entry.name.is_empty() {
            values.push(0);
            continue;
        }
        let value = match table.find_defined(&entry.name) {
            Some(local) => Some(defined_value(&table.entries[local].raw, base)),
            None => import(&entry.name),
        };
        match value {
            Some(value) => values.push(value),
            None if sym.is_weak() => {
                log::warn!("[PLAM] weak symbol `{}` unresolved, binding to 0", entry.name);
                warnings.push(LoadWarning::UnresolvedWeakSymbol(entry.name.clone()));
                values.push(0);
            }
            None => return Err(LoadError::UnresolvedSymbol(entry.name.clone())),
        }
    }
    Ok(values)
}

/// Build the export list from resolved values.
pub fn exports(table: &SymbolTable, indices: &[u32], values: &[u64]) -> Vec<ExportedSymbol> {
    indices
        .iter()
        .filter_map(|&idx| {
            let entry = table.get(idx)?;
            Some(ExportedSymbol {
                name: entry.name.clone(),
                address: *values.get(idx as usize)?,
                size: entry.raw.size,
                sym_type: entry.raw.sym_type,
                binding: entry.raw.binding,
            })
        })
        .collect()
}
