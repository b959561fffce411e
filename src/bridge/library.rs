//! The contract between the registry and a host-implemented library.
//!
//! A library is a Rust type that owns one Globals block in guest memory plus whatever host
//! resources it needs. Its guest-callable entry points are plain functions
//! ([`Trampoline`]) that receive the library itself and the guest register file; nothing
//! else is reachable from inside a trampoline.

use std::{fmt, path::PathBuf, sync::Arc};

use crate::{
    bridge::state::MachineState,
    memory::{AddressSpace, GuestAddress},
    Result,
};

/// A guest-callable entry point.
pub type Trampoline<L> = fn(&mut L, &mut MachineState) -> Result<()>;

/// Identifies a loaded library instance within a [`crate::bridge::LibraryRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LibraryHandle(pub(crate) u64);

impl fmt::Display for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A callable code symbol: which library, which trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeEntry {
    /// Library that owns the trampoline
    pub library: LibraryHandle,
    /// Index into the library's trampoline table
    pub slot: usize,
}

/// Outcome of resolving an imported symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolResolution {
    /// The symbol is a function implemented on the host
    Code(CodeEntry),
    /// The symbol is data inside a library's Globals block
    Data(GuestAddress),
    /// No library exports the symbol
    NotFound,
}

impl SymbolResolution {
    /// True unless the symbol was not found.
    #[must_use]
    pub fn is_found(&self) -> bool {
        !matches!(self, SymbolResolution::NotFound)
    }
}

/// Result of a lookup inside a single library, before the registry attaches its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibrarySymbol {
    /// Index into [`Library::trampolines`]
    Code(usize),
    /// Address inside the Globals block
    Data(GuestAddress),
    /// Not exported by this library
    NotFound,
}

/// A named data export, resolved against a loaded library instance.
pub struct DataExport<L> {
    /// Guest-visible symbol name
    pub name: &'static str,
    /// Computes the symbol's guest address from the loaded library
    pub accessor: fn(&L) -> GuestAddress,
}

/// What a library gets to work with when it is loaded.
#[derive(Debug, Clone)]
pub struct LibraryContext {
    /// Shared guest memory
    pub space: Arc<AddressSpace>,
    /// UI helper program, if the host provides one
    pub ui_head: Option<PathBuf>,
    /// Arguments passed to the UI helper program
    pub ui_head_args: Vec<String>,
}

impl LibraryContext {
    /// A context without a UI helper.
    #[must_use]
    pub fn new(space: Arc<AddressSpace>) -> Self {
        LibraryContext {
            space,
            ui_head: None,
            ui_head_args: Vec::new(),
        }
    }

    /// Set the UI helper program that libraries delegate window-server calls to.
    #[must_use]
    pub fn ui_head(mut self, program: impl Into<PathBuf>) -> Self {
        self.ui_head = Some(program.into());
        self
    }

    /// Set the UI helper's arguments.
    #[must_use]
    pub fn ui_head_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ui_head_args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// A host implementation of a guest shared library.
///
/// Entry points are listed in [`Library::trampolines`] under the name
/// `<Library::NAME>_<symbol>`; data symbols are listed in [`Library::data_exports`].
/// Loaded instances live in a [`crate::bridge::LibraryRegistry`] that may be shared between
/// threads.
pub trait Library: Send + Sync + Sized + 'static {
    /// Name guest containers import the library by.
    const NAME: &'static str;

    /// Allocate and initialize the library's Globals block.
    ///
    /// # Errors
    /// Returns allocation failures and any host-side setup failure.
    fn load(context: &LibraryContext) -> Result<Self>;

    /// The trampoline table.
    fn trampolines() -> &'static [(&'static str, Trampoline<Self>)];

    /// The data-export registration table, in lookup order.
    fn data_exports() -> &'static [DataExport<Self>];

    /// Release host resources, then free the Globals block.
    ///
    /// # Errors
    /// Returns the first failure; cleanup still runs to completion.
    fn unload(self) -> Result<()>;

    /// Resolve a guest-visible symbol name.
    fn lookup(&self, name: &str) -> LibrarySymbol {
        let entry_name = format!("{}_{}", Self::NAME, name);
        if let Some(slot) = Self::trampolines()
            .iter()
            .position(|(entry, _)| *entry == entry_name)
        {
            return LibrarySymbol::Code(slot);
        }

        match Self::data_exports().iter().find(|export| export.name == name) {
            Some(export) => LibrarySymbol::Data((export.accessor)(self)),
            None => LibrarySymbol::NotFound,
        }
    }
}
