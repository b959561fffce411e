// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![warn(missing_docs)]
//#![deny(unsafe_code)]
// - 'file/physical.rs' uses mmap to map a file into memory

//! # pefrun
//!
//! Loader and host bridge for running classic Mac OS PowerPC executables under emulation.
//!
//! Classic Mac OS code fragments ship as PEF ("Preferred Executable Format") containers: a
//! big-endian header, a table of sections and, for most of them, compressed data that is
//! expanded by a small bytecode ("pattern-initialized data") when the fragment is prepared.
//! `pefrun` parses such containers, instantiates their sections into memory and provides the
//! host side of the guest's shared libraries, so that an execution engine only has to run
//! PowerPC instructions.
//!
//! ## Features
//!
//! - **📦 Container loading** - Header and section table validation, raw and pattern-initialized
//!   section instantiation, loader-section import tables
//! - **🧩 Pattern expansion** - Strict decoder for the 5-opcode initialization bytecode, plus an
//!   encoder for building test fixtures
//! - **🧠 Guest memory** - A shared 32-bit address space with host-side typed access
//! - **🔌 Library bridge** - Registry of host-implemented libraries with symbol resolution and
//!   trampoline dispatch
//! - **📡 UI delegation** - A synchronous request/response pipe protocol to a helper process
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pefrun::prelude::*;
//!
//! let container = Container::from_file(std::path::Path::new("SimpleText"))?;
//! for section in container.sections() {
//!     println!("{:<12} {:>8} bytes", section.kind(), section.len());
//! }
//!
//! if let Some(loader) = container.loader_info()? {
//!     for library in &loader.libraries {
//!         println!("imports {} symbols from {}", library.symbols.len(), library.name);
//!     }
//! }
//! # Ok::<(), pefrun::Error>(())
//! ```
//!
//! ### Resolving imports
//!
//! ```rust
//! use std::sync::Arc;
//! use pefrun::prelude::*;
//!
//! let space = Arc::new(AddressSpace::default());
//! let registry = LibraryRegistry::new(LibraryContext::new(space));
//! pefrun::libraries::register_builtins(&registry);
//! registry.load("StdCLib")?;
//!
//! assert!(registry.resolve("errno")?.is_found());
//! assert_eq!(registry.resolve("NewWindow")?, SymbolResolution::NotFound);
//! # Ok::<(), pefrun::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`container`] - Container header, section instantiation, pattern expansion, loader section
//! - [`memory`] - Guest address space and the [`memory::Allocator`] contract
//! - [`bridge`] - Library contract, registry, register file and RPC channel
//! - [`libraries`] - Built-in `StdCLib` and `InterfaceLib`
//! - [`file`] - Input sources (memory-mapped or in-memory) and the byte [`Parser`]
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Logging
//!
//! The library logs through the [`log`](https://docs.rs/log) facade and never installs a
//! logger itself.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types.
pub mod prelude;

/// Container sources and byte-level parsing.
pub mod file;

/// PEF containers: header, sections, pattern expansion and loader section.
///
/// See [`Container`] for the entry point.
pub mod container;

/// The shared guest address space.
pub mod memory;

/// Host libraries, their registry and the UI helper protocol.
pub mod bridge;

/// Built-in host libraries.
pub mod libraries;

/// `pefrun` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always [`Error`].
///
/// ```rust,no_run
/// use pefrun::{Container, Result};
///
/// fn load(path: &str) -> Result<Container> {
///     Container::from_file(std::path::Path::new(path))
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `pefrun` Error type
///
/// See [`error::Error`](crate::Error) for the individual categories.
pub use error::Error;

/// Main entry point for loading PEF containers.
///
/// # Example
///
/// ```rust,no_run
/// use pefrun::Container;
/// let container = Container::from_file(std::path::Path::new("SimpleText"))?;
/// println!("{} sections", container.section_headers().len());
/// # Ok::<(), pefrun::Error>(())
/// ```
pub use container::Container;

/// Low-level file and memory parsing utilities.
///
/// # Example
///
/// ```rust
/// use pefrun::Parser;
/// let bytes = [0x81, 0x00];
/// let mut parser = Parser::new(&bytes);
/// assert_eq!(parser.read_varint()?, 0x80);
/// # Ok::<(), pefrun::Error>(())
/// ```
pub use file::{parser::Parser, File};
