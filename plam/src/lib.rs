//! PLAM container format and module loader
//!
//! This crate reads, verifies, maps and links PLAM containers: the
//! architecture-tagged format PlumOS uses for kernels, drivers, shared
//! libraries, applications and hot-pluggable modules. It also writes them,
//! for the packaging tool.
//!
//! # Architecture
//!
//! - `codec` / `header` / `tables` / `format`: little-endian, 1-byte packed records
//! - `integrity`: header CRC-32, build hash, resource hashes, Ed25519 signatures
//! - `fat`: per-architecture sub-image selection
//! - `container`: opening a buffer as a verified container (incl. whole-file compression)
//! - `mapper`: section table to in-memory image
//! - `symbols` / `reloc`: symbol binding and relocation
//! - `deps`: dependency matching and batch load order
//! - `resources`: lazily decoded, hash-checked resources
//! - `loader` / `registry` / `space`: loader context, module and symbol registries,
//!   address-space collaborator
//! - `driver`: driver capability interface
//! - `writer`: container and fat-container builders
//! - `legacy`: deprecated PLM2 reader

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arena;
pub mod codec;
pub mod compress;
pub mod config;
pub mod container;
pub mod deps;
pub mod driver;
pub mod error;
pub mod fat;
pub mod format;
pub mod header;
pub mod integrity;
pub mod legacy;
pub mod loader;
pub mod mapper;
pub mod registry;
pub mod reloc;
pub mod resources;
pub mod space;
pub mod symbols;
pub mod tables;
pub mod writer;

pub use config::{CpuRequest, LoadPolicy};
pub use container::Container;
pub use deps::{DependencySpec, SemVer};
pub use driver::{BoundDriver, DriverCatalog, DriverInterface};
pub use error::{LoadError, LoadWarning, Result};
pub use header::ContainerHeader;
pub use integrity::SignatureStatus;
pub use loader::{LoadRequest, LoadedModule, LoaderContext};
pub use registry::ModuleId;
pub use space::{AddressSpace, InMemoryAddressSpace, MappingRequest, Protection, Reservation};
pub use writer::{BuildError, ContainerBuilder, FatBuilder, ResourceSpec, SectionSpec, SymbolSpec};
