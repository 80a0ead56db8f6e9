//! Driver capability interface
//!
//! A driver module advertises itself by exporting the dispatch-table symbol.
//! The implementation behind it is picked by name from a [`DriverCatalog`];
//! the rest of the system only ever talks to [`DriverInterface`].

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{LoadError, Result};
use crate::registry::ModuleId;

/// Operations every installable driver provides.
pub trait DriverInterface: Send {
    fn name(&self) -> &str;

    /// Called once with the address of the module's dispatch table.
    fn init(&mut self, dispatch_table: u64) -> Result<()>;

    fn shutdown(&mut self);

    fn dispatch(&mut self, op: u32, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Creates a fresh driver instance.
pub type DriverFactory = fn() -> Box<dyn DriverInterface>;

/// Driver implementations known to the system, by name.
#[derive(Default)]
pub struct DriverCatalog {
    factories: BTreeMap<String, DriverFactory>,
}

impl DriverCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, factory: DriverFactory) {
        self.factories.insert(String::from(name), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate the named implementation.
    pub fn instantiate(&self, name: &str) -> Result<Box<dyn DriverInterface>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| LoadError::DriverUnavailable(String::from(name)))?;
        Ok(factory())
    }
}

/// An initialised driver bound to a loaded module.
pub struct BoundDriver {
    module: ModuleId,
    dispatch_table: u64,
    driver: Box<dyn DriverInterface>,
}

impl core::fmt::Debug for BoundDriver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BoundDriver")
            .field("module", &self.module)
            .field("dispatch_table", &self.dispatch_table)
            .field("driver", &self.driver.name())
            .finish()
    }
}

impl BoundDriver {
    pub(crate) fn bind(
        module: ModuleId,
        dispatch_table: u64,
        mut driver: Box<dyn DriverInterface>,
    ) -> Result<Self> {
        driver.init(dispatch_table)?;
        log::info!(
            "[PLAM] driver `{}` bound, dispatch table at {:#x}",
            driver.name(),
            dispatch_table
        );
        Ok(Self {
            module,
            dispatch_table,
            driver,
        })
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn dispatch_table(&self) -> u64 {
        self.dispatch_table
    }

    pub fn name(&self) -> &str {
        self.driver.name()
    }

    pub fn dispatch(&mut self, op: u32, payload: &[u8]) -> Result<Vec<u8>> {
        self.driver.dispatch(op, payload)
    }

    pub fn shutdown(mut self) {
        self.driver.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    struct Echo {
        table: u64,
    }

    impl DriverInterface for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn init(&mut self, dispatch_table: u64) -> Result<()> {
            self.table = dispatch_table;
            Ok(())
        }

        fn shutdown(&mut self) {}

        fn dispatch(&mut self, op: u32, payload: &[u8]) -> Result<Vec<u8>> {
            let mut out = op.to_le_bytes().to_vec();
            out.extend_from_slice(payload);
            Ok(out)
        }
    }

    fn echo() -> Box<dyn DriverInterface> {
        Box::new(Echo { table: 0 })
    }

    #[test]
    fn test_catalog_instantiates_by_name() {
        let mut catalog = DriverCatalog::new();
        catalog.register("echo", echo);
        assert!(catalog.contains("echo"));
        assert!(matches!(
            catalog.instantiate("vulkan"),
            Err(LoadError::DriverUnavailable(_))
        ));

        let id = Arena::new().insert(());
        let mut bound = BoundDriver::bind(id, 0x5000, catalog.instantiate("echo").unwrap()).unwrap();
        assert_eq!(bound.dispatch(1, b"hi").unwrap(), alloc::vec![1, 0, 0, 0, b'h', b'i']);
        assert_eq!(bound.dispatch_table(), 0x5000);
        bound.shutdown();
    }
}
