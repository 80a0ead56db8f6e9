//! Dependency Graph Resolution
//!
//! Matches a container's dependency entries against loaded modules and orders
//! a batch of containers so every strong dependency loads first. Weak and
//! optional edges never force an order and break cycles.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::codec::decode_table;
use crate::error::{LoadError, LoadWarning, Result};
use crate::format::DependencyFlags;
use crate::header::ContainerHeader;
use crate::tables::{Dependency, StringTable};

/// Semantic version packed as `major:16 | minor:16 | patch:32`, so that the
/// integer order of packed values is the version order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SemVer {
    pub major: u16,
    pub minor: u16,
    pub patch: u32,
}

impl SemVer {
    pub const fn new(major: u16, minor: u16, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    pub const fn from_packed(raw: u64) -> Self {
        Self {
            major: (raw >> 48) as u16,
            minor: (raw >> 32) as u16,
            patch: raw as u32,
        }
    }

    pub const fn packed(self) -> u64 {
        (self.major as u64) << 48 | (self.minor as u64) << 32 | self.patch as u64
    }

    /// Parse `major[.minor[.patch]]`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
        let patch = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Dependency entry with its name resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub name: String,
    pub version: SemVer,
    pub uuid: [u8; 16],
    pub flags: DependencyFlags,
}

impl DependencySpec {
    pub fn is_soft(&self) -> bool {
        self.flags
            .intersects(DependencyFlags::WEAK | DependencyFlags::OPTIONAL)
    }

    /// All-zero UUID accepts any module of the name.
    pub fn accepts(&self, version: SemVer, uuid: &[u8; 16]) -> bool {
        let any_uuid = self.uuid == [0u8; 16];
        (any_uuid || &self.uuid == uuid) && version >= self.version
    }
}

/// Decode the dependency table (`import_off`, `deps_cnt`).
pub fn decode_dependencies(
    header: &ContainerHeader,
    container: &[u8],
    strings: StringTable<'_>,
) -> Result<Vec<DependencySpec>> {
    let raw: Vec<Dependency> = decode_table(container, header.import_off, header.deps_cnt)?;
    raw.iter()
        .map(|dep| {
            Ok(DependencySpec {
                name: strings.get_owned(dep.name_off)?,
                version: SemVer::from_packed(dep.version),
                uuid: dep.uuid,
                flags: dep.flags,
            })
        })
        .collect()
}

/// What the registry knows about a loaded module of a given name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate<K> {
    pub key: K,
    pub version: SemVer,
    pub uuid: [u8; 16],
}

/// A dependency bound to a loaded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency<K> {
    pub name: String,
    pub module: K,
    pub soft: bool,
}

/// Bind each dependency to a loaded module via `lookup`.
///
/// Missing soft dependencies are skipped with a warning; a missing (or too
/// old, or wrong-UUID) strong dependency is `MissingDependency`.
pub fn resolve_dependencies<K, F>(
    deps: &[DependencySpec],
    mut lookup: F,
    warnings: &mut Vec<LoadWarning>,
) -> Result<Vec<ResolvedDependency<K>>>
where
    F: FnMut(&str) -> Option<Candidate<K>>,
{
    let mut resolved = Vec::with_capacity(deps.len());
    for dep in deps {
        let found = lookup(&dep.name).filter(|c| dep.accepts(c.version, &c.uuid));
        match found {
            Some(candidate) => resolved.push(ResolvedDependency {
                name: dep.name.clone(),
                module: candidate.key,
                soft: dep.is_soft(),
            }),
            None if dep.is_soft() => {
                log::warn!(
                    "[PLAM] optional dependency `{}` >= {} not available",
                    dep.name,
                    dep.version
                );
                warnings.push(LoadWarning::MissingSoftDependency {
                    name: dep.name.clone(),
                    required: dep.version.packed(),
                });
            }
            None => {
                return Err(LoadError::MissingDependency {
                    name: dep.name.clone(),
                    required: dep.version.packed(),
                })
            }
        }
    }
    Ok(resolved)
}

/// A node of a load batch: module name and its dependency edges.
#[derive(Debug, Clone)]
pub struct BatchNode<'a> {
    pub name: &'a str,
    pub deps: &'a [DependencySpec],
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Check a batch for strong cycles and return a load order (indices into
/// `nodes`, dependencies first).
///
/// Depth-first walk with gray/black colouring over the strong edges that point
/// at other members of the batch; reaching a gray node means a cycle made only
/// of strong edges. Edges to modules outside the batch are resolved later
/// against the registry.
pub fn load_order(nodes: &[BatchNode<'_>]) -> Result<Vec<usize>> {
    let index: HashMap<&str, usize> = nodes.iter().enumerate().map(|(i, n)| (n.name, i)).collect();
    let edges: Vec<Vec<usize>> = nodes
        .iter()
        .map(|node| {
            node.deps
                .iter()
                .filter(|d| !d.is_soft())
                .filter_map(|d| index.get(d.name.as_str()).copied())
                .collect()
        })
        .collect();

    let mut color = alloc::vec![Color::White; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());
    for root in 0..nodes.len() {
        if color[root] != Color::White {
            continue;
        }
        // Explicit stack of (node, next edge to follow).
        let mut stack: Vec<(usize, usize)> = alloc::vec![(root, 0)];
        color[root] = Color::Gray;
        while let Some(top) = stack.last_mut() {
            let node = top.0;
            if let Some(&dep) = edges[node].get(top.1) {
                top.1 += 1;
                match color[dep] {
                    Color::White => {
                        color[dep] = Color::Gray;
                        stack.push((dep, 0));
                    }
                    Color::Gray => {
                        log::warn!(
                            "[PLAM] deps: cycle {} -> {}",
                            nodes[node].name,
                            nodes[dep].name
                        );
                        return Err(LoadError::DependencyCycle(String::from(nodes[dep].name)));
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                order.push(node);
                stack.pop();
            }
        }
    }
    Ok(order)
}
