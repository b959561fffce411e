//! The guest/host bridge.
//!
//! Guest containers import their system libraries by name. This module provides the
//! machinery that stands in for those libraries on the host:
//!
//! - [`library`] - the [`Library`] contract, symbol resolution results and load context
//! - [`registry`] - [`LibraryRegistry`], which loads, resolves, invokes and unloads libraries
//! - [`state`] - the guest register file trampolines operate on
//! - [`rpc`] - the synchronous pipe protocol used to delegate calls to a helper process
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use pefrun::bridge::{LibraryContext, LibraryRegistry, MachineState, SymbolResolution};
//! use pefrun::libraries::StdCLib;
//! use pefrun::memory::AddressSpace;
//!
//! let space = Arc::new(AddressSpace::default());
//! let registry = LibraryRegistry::new(LibraryContext::new(space.clone()));
//! registry.register::<StdCLib>();
//! registry.load("StdCLib")?;
//!
//! if let SymbolResolution::Code(entry) = registry.resolve("strlen")? {
//!     let text = space.allocate_cstring("hello")?;
//!     let mut state = MachineState::new();
//!     state.gpr[3] = text.value();
//!     registry.invoke(entry, &mut state)?;
//!     assert_eq!(state.return_value(), 5);
//! }
//! # Ok::<(), pefrun::Error>(())
//! ```

pub mod library;
pub mod registry;
pub mod rpc;
pub mod state;

pub use library::{
    CodeEntry, DataExport, Library, LibraryContext, LibraryHandle, LibrarySymbol,
    SymbolResolution, Trampoline,
};
pub use registry::LibraryRegistry;
pub use rpc::{Channel, UiChannel, UiMessage, WireArg, WireValue};
pub use state::MachineState;
