//! Library lifecycle and symbol resolution.
//!
//! The registry knows every library implementation by name (registered factories) and owns
//! every loaded instance. Import binding asks it to resolve symbols; the execution engine
//! asks it to invoke the trampolines those symbols resolved to. Libraries are unloaded in
//! reverse load order, at the latest when the registry is dropped.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use dashmap::DashMap;
use log::{info, trace, warn};

use crate::{
    bridge::{
        library::{
            CodeEntry, Library, LibraryContext, LibraryHandle, LibrarySymbol, SymbolResolution,
        },
        state::MachineState,
    },
    Error::{InvalidHandle, LibraryNotFound},
    Result,
};

/// Object-safe view of a loaded [`Library`].
trait LoadedLibrary: Send + Sync {
    fn name(&self) -> &'static str;
    fn lookup(&self, name: &str) -> LibrarySymbol;
    fn entry_name(&self, slot: usize) -> Option<&'static str>;
    fn invoke(&mut self, slot: usize, state: &mut MachineState) -> Result<()>;
    fn unload(self: Box<Self>) -> Result<()>;
}

impl<L: Library> LoadedLibrary for L {
    fn name(&self) -> &'static str {
        L::NAME
    }

    fn lookup(&self, name: &str) -> LibrarySymbol {
        Library::lookup(self, name)
    }

    fn entry_name(&self, slot: usize) -> Option<&'static str> {
        L::trampolines().get(slot).map(|(name, _)| *name)
    }

    fn invoke(&mut self, slot: usize, state: &mut MachineState) -> Result<()> {
        let Some((_, trampoline)) = L::trampolines().get(slot) else {
            return Err(InvalidHandle);
        };
        trampoline(self, state)
    }

    fn unload(self: Box<Self>) -> Result<()> {
        Library::unload(*self)
    }
}

type Factory = fn(&LibraryContext) -> Result<Box<dyn LoadedLibrary>>;

fn instantiate<L: Library>(context: &LibraryContext) -> Result<Box<dyn LoadedLibrary>> {
    Ok(Box::new(L::load(context)?))
}

/// Owns the loaded libraries of one guest process.
///
/// The registry is `Send + Sync`; `invoke` holds the target library exclusively for the
/// duration of the call.
pub struct LibraryRegistry {
    context: LibraryContext,
    factories: DashMap<&'static str, Factory>,
    loaded: DashMap<LibraryHandle, Box<dyn LoadedLibrary>>,
    load_order: Mutex<Vec<LibraryHandle>>,
    next_handle: AtomicU64,
}

impl LibraryRegistry {
    /// An empty registry; libraries are loaded with `context`.
    #[must_use]
    pub fn new(context: LibraryContext) -> Self {
        LibraryRegistry {
            context,
            factories: DashMap::new(),
            loaded: DashMap::new(),
            load_order: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// The context libraries are loaded with.
    #[must_use]
    pub fn context(&self) -> &LibraryContext {
        &self.context
    }

    /// Make library `L` loadable under [`Library::NAME`].
    pub fn register<L: Library>(&self) {
        self.factories.insert(L::NAME, instantiate::<L>);
    }

    /// Names of all registered libraries, sorted.
    #[must_use]
    pub fn registered(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.iter().map(|entry| *entry.key()).collect();
        names.sort_unstable();
        names
    }

    /// Load a library by name.
    ///
    /// Loading a library that is already loaded returns the existing handle.
    ///
    /// # Errors
    /// Returns [`crate::Error::LibraryNotFound`] for an unregistered name, or the library's
    /// own load failure.
    pub fn load(&self, name: &str) -> Result<LibraryHandle> {
        if let Some(handle) = self.handle(name) {
            return Ok(handle);
        }

        let factory = match self.factories.get(name) {
            Some(factory) => *factory.value(),
            None => return Err(LibraryNotFound(name.to_string())),
        };

        let library = factory(&self.context)?;
        let handle = LibraryHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.loaded.insert(handle, library);
        lock!(self.load_order)?.push(handle);

        info!("Loaded library {name} as {handle}");
        Ok(handle)
    }

    /// Handle of a loaded library, by name.
    #[must_use]
    pub fn handle(&self, name: &str) -> Option<LibraryHandle> {
        self.loaded
            .iter()
            .find(|entry| entry.value().name() == name)
            .map(|entry| *entry.key())
    }

    /// Number of loaded libraries.
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    /// Resolve `name` in one loaded library.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidHandle`] if `handle` is not loaded.
    pub fn lookup(&self, handle: LibraryHandle, name: &str) -> Result<SymbolResolution> {
        let library = self.loaded.get(&handle).ok_or(InvalidHandle)?;
        Ok(match library.lookup(name) {
            LibrarySymbol::Code(slot) => SymbolResolution::Code(CodeEntry {
                library: handle,
                slot,
            }),
            LibrarySymbol::Data(address) => SymbolResolution::Data(address),
            LibrarySymbol::NotFound => SymbolResolution::NotFound,
        })
    }

    /// Resolve `name` in the first loaded library, in load order, that exports it.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the registry lock is poisoned.
    pub fn resolve(&self, name: &str) -> Result<SymbolResolution> {
        let order = lock!(self.load_order)?.clone();
        for handle in order {
            let resolution = self.lookup(handle, name)?;
            if resolution.is_found() {
                return Ok(resolution);
            }
        }

        warn!("Unresolved symbol {name}");
        Ok(SymbolResolution::NotFound)
    }

    /// Name of the trampoline behind a code entry, for diagnostics.
    #[must_use]
    pub fn entry_name(&self, entry: CodeEntry) -> Option<&'static str> {
        self.loaded
            .get(&entry.library)
            .and_then(|library| library.entry_name(entry.slot))
    }

    /// Run the trampoline behind `entry` on the guest register file.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidHandle`] for a stale entry, or the trampoline's own
    /// failure.
    pub fn invoke(&self, entry: CodeEntry, state: &mut MachineState) -> Result<()> {
        let mut library = self.loaded.get_mut(&entry.library).ok_or(InvalidHandle)?;
        trace!(
            "Invoking {}",
            library.entry_name(entry.slot).unwrap_or("<invalid slot>")
        );
        library.invoke(entry.slot, state)
    }

    /// Unload one library.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidHandle`] if `handle` is not loaded, or the library's
    /// unload failure.
    pub fn unload(&self, handle: LibraryHandle) -> Result<()> {
        let (_, library) = self.loaded.remove(&handle).ok_or(InvalidHandle)?;
        lock!(self.load_order)?.retain(|loaded| *loaded != handle);

        let name = library.name();
        library.unload()?;
        info!("Unloaded library {name} ({handle})");
        Ok(())
    }

    /// Unload every library in reverse load order.
    ///
    /// # Errors
    /// Returns the first unload failure; the remaining libraries are still unloaded.
    pub fn unload_all(&self) -> Result<()> {
        let order: Vec<_> = lock!(self.load_order)?.iter().rev().copied().collect();
        let mut first_error = None;

        for handle in order {
            if let Err(error) = self.unload(handle) {
                warn!("Failed to unload library {handle}: {error}");
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Drop for LibraryRegistry {
    fn drop(&mut self) {
        if let Err(error) = self.unload_all() {
            warn!("Library cleanup failed: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, sync::Arc};

    use super::*;
    use crate::{
        bridge::library::{DataExport, Trampoline},
        memory::{AddressSpace, Allocator, GuestAddress},
        test::address_space,
        Error,
    };

    thread_local! {
        static UNLOADS: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
    }

    struct Counter {
        space: Arc<AddressSpace>,
        globals: GuestAddress,
        calls: u32,
    }

    fn increment(counter: &mut Counter, state: &mut MachineState) -> Result<()> {
        counter.calls += 1;
        counter.space.store(counter.globals, counter.calls)?;
        state.set_return(counter.calls);
        Ok(())
    }

    fn counter_count(counter: &Counter) -> GuestAddress {
        counter.globals
    }

    fn counter_flags(counter: &Counter) -> GuestAddress {
        GuestAddress(counter.globals.value() + 4)
    }

    static COUNTER_TRAMPOLINES: &[(&str, Trampoline<Counter>)] =
        &[("Counter_increment", increment)];
    static COUNTER_EXPORTS: &[DataExport<Counter>] = &[
        DataExport {
            name: "count",
            accessor: counter_count,
        },
        DataExport {
            name: "flags",
            accessor: counter_flags,
        },
    ];

    impl Library for Counter {
        const NAME: &'static str = "Counter";

        fn load(context: &LibraryContext) -> Result<Self> {
            let globals = context.space.allocate(8, "Counter globals")?;
            Ok(Counter {
                space: context.space.clone(),
                globals,
                calls: 0,
            })
        }

        fn trampolines() -> &'static [(&'static str, Trampoline<Self>)] {
            COUNTER_TRAMPOLINES
        }

        fn data_exports() -> &'static [DataExport<Self>] {
            COUNTER_EXPORTS
        }

        fn unload(self) -> Result<()> {
            UNLOADS.with(|unloads| unloads.borrow_mut().push(Self::NAME));
            self.space.deallocate(self.globals)
        }
    }

    struct Other {
        space: Arc<AddressSpace>,
        globals: GuestAddress,
    }

    fn other_count(other: &Other) -> GuestAddress {
        other.globals
    }

    static OTHER_EXPORTS: &[DataExport<Other>] = &[DataExport {
        name: "count",
        accessor: other_count,
    }];

    impl Library for Other {
        const NAME: &'static str = "Other";

        fn load(context: &LibraryContext) -> Result<Self> {
            Ok(Other {
                space: context.space.clone(),
                globals: context.space.allocate(4, "Other globals")?,
            })
        }

        fn trampolines() -> &'static [(&'static str, Trampoline<Self>)] {
            &[]
        }

        fn data_exports() -> &'static [DataExport<Self>] {
            OTHER_EXPORTS
        }

        fn unload(self) -> Result<()> {
            UNLOADS.with(|unloads| unloads.borrow_mut().push(Self::NAME));
            self.space.deallocate(self.globals)
        }
    }

    fn registry(space: &Arc<AddressSpace>) -> LibraryRegistry {
        let registry = LibraryRegistry::new(LibraryContext::new(space.clone()));
        registry.register::<Counter>();
        registry.register::<Other>();
        registry
    }

    #[test]
    fn lookup_and_invoke() {
        let space = address_space();
        let registry = registry(&space);
        let handle = registry.load("Counter").unwrap();
        assert_eq!(registry.load("Counter").unwrap(), handle);

        let SymbolResolution::Code(entry) = registry.lookup(handle, "increment").unwrap() else {
            panic!("increment should be code");
        };
        assert_eq!(registry.entry_name(entry), Some("Counter_increment"));

        let mut state = MachineState::new();
        registry.invoke(entry, &mut state).unwrap();
        registry.invoke(entry, &mut state).unwrap();
        assert_eq!(state.return_value(), 2);

        let SymbolResolution::Data(count) = registry.lookup(handle, "count").unwrap() else {
            panic!("count should be data");
        };
        assert_eq!(space.load::<u32>(count).unwrap(), 2);

        // The mangled entry name itself is not a guest symbol
        assert_eq!(
            registry.lookup(handle, "Counter_increment").unwrap(),
            SymbolResolution::NotFound
        );
        assert_eq!(
            registry.lookup(handle, "missing").unwrap(),
            SymbolResolution::NotFound
        );
    }

    #[test]
    fn resolve_in_load_order() {
        let space = address_space();
        let registry = registry(&space);
        registry.load("Other").unwrap();
        let counter = registry.load("Counter").unwrap();

        let other_globals = match registry.resolve("count").unwrap() {
            SymbolResolution::Data(address) => address,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(space.label(other_globals).unwrap().as_deref(), Some("Other globals"));

        assert!(matches!(
            registry.resolve("increment").unwrap(),
            SymbolResolution::Code(CodeEntry { library, .. }) if library == counter
        ));
        assert_eq!(registry.resolve("nothing").unwrap(), SymbolResolution::NotFound);
    }

    #[test]
    fn errors() {
        let space = address_space();
        let registry = registry(&space);
        assert!(matches!(
            registry.load("DriverServicesLib"),
            Err(Error::LibraryNotFound(name)) if name == "DriverServicesLib"
        ));

        let handle = registry.load("Counter").unwrap();
        let SymbolResolution::Code(entry) = registry.lookup(handle, "increment").unwrap() else {
            panic!("increment should be code");
        };
        registry.unload(handle).unwrap();

        let mut state = MachineState::new();
        assert!(matches!(
            registry.invoke(entry, &mut state),
            Err(Error::InvalidHandle)
        ));
        assert!(matches!(registry.lookup(handle, "count"), Err(Error::InvalidHandle)));
        assert!(matches!(registry.unload(handle), Err(Error::InvalidHandle)));

        let bad_slot = CodeEntry {
            library: registry.load("Counter").unwrap(),
            slot: 7,
        };
        assert!(matches!(
            registry.invoke(bad_slot, &mut state),
            Err(Error::InvalidHandle)
        ));
    }

    #[test]
    fn registry_is_thread_safe() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LibraryRegistry>();
    }

    #[test]
    fn drop_unloads_in_reverse_order() {
        let space = address_space();
        {
            let registry = registry(&space);
            registry.load("Counter").unwrap();
            registry.load("Other").unwrap();
            assert_eq!(space.allocation_count().unwrap(), 2);
            UNLOADS.with(|unloads| unloads.borrow_mut().clear());
        }

        assert_eq!(space.allocation_count().unwrap(), 0);
        UNLOADS.with(|unloads| assert_eq!(*unloads.borrow(), vec!["Other", "Counter"]));
    }
}
