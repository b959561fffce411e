//! # pefrun Prelude
//!
//! Re-exports the types most programs need to load a container and bridge its imports.
//!
//! ```rust
//! use pefrun::prelude::*;
//! ```

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all pefrun operations
pub use crate::Error;

/// The result type used throughout pefrun
pub use crate::Result;

/// Low-level file parsing utilities
pub use crate::{File, Parser};

// ================================================================================================
// Containers
// ================================================================================================

pub use crate::container::{
    Architecture, Container, ContainerHeader, ImportedLibrary, ImportedSymbol, LoaderConfig,
    LoaderInfo, Section, SectionHeader, SectionKind, ShareKind, SymbolClass,
};

/// Pattern expansion and encoding
pub use crate::container::pattern::{expand, PatternEncoder, PatternOpcode};

// ================================================================================================
// Guest Memory
// ================================================================================================

pub use crate::memory::{AddressSpace, AddressSpaceConfig, Allocator, GuestAddress, HostPtr};

// ================================================================================================
// Library Bridge
// ================================================================================================

pub use crate::bridge::{
    CodeEntry, Library, LibraryContext, LibraryHandle, LibraryRegistry, MachineState,
    SymbolResolution, UiChannel, UiMessage,
};

/// Built-in libraries
pub use crate::libraries::{InterfaceLib, StdCLib};
