//! Loader-section parsing.
//!
//! The loader section (kind 4) describes what the container needs from the outside world:
//! entry points, imported libraries and the symbols imported from each of them. Relocations
//! and the export hash table are left in place for the binding step.

use bitflags::bitflags;
use strum::{Display, EnumIter};

use crate::{file::parser::Parser, Result};

/// Size of the loader-section header in bytes.
pub const LOADER_HEADER_SIZE: usize = 56;
/// Size of one imported-library descriptor in bytes.
pub const IMPORTED_LIBRARY_SIZE: usize = 24;

bitflags! {
    /// Options stored with an imported library.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LibraryOptions: u8 {
        /// The container can run without this library
        const WEAK_IMPORT = 0x40;
        /// The library must be initialized before the importing container
        const INIT_BEFORE = 0x80;
    }
}

bitflags! {
    /// Flags stored in the class byte of an imported symbol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SymbolFlags: u8 {
        /// Unresolved references are bound to address 0 instead of failing
        const WEAK = 0x80;
    }
}

/// What an imported symbol refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum SymbolClass {
    /// A code address
    Code,
    /// A data address
    Data,
    /// A transition vector (function descriptor)
    TVector,
    /// A TOC symbol
    Toc,
    /// A linker-inserted glue routine
    Glue,
}

impl SymbolClass {
    /// Decode the low nibble of a symbol class byte.
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<SymbolClass> {
        match bits & 0x0F {
            0 => Some(SymbolClass::Code),
            1 => Some(SymbolClass::Data),
            2 => Some(SymbolClass::TVector),
            3 => Some(SymbolClass::Toc),
            4 => Some(SymbolClass::Glue),
            _ => None,
        }
    }
}

/// Fixed header at the start of the loader section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderHeader {
    /// Section holding the main symbol, -1 if none
    pub main_section: i32,
    /// Offset of the main symbol within its section
    pub main_offset: u32,
    /// Section holding the initialization routine, -1 if none
    pub init_section: i32,
    /// Offset of the initialization routine
    pub init_offset: u32,
    /// Section holding the termination routine, -1 if none
    pub term_section: i32,
    /// Offset of the termination routine
    pub term_offset: u32,
    /// Number of imported libraries
    pub imported_library_count: u32,
    /// Number of imported symbols across all libraries
    pub total_imported_symbol_count: u32,
    /// Number of sections with relocations
    pub reloc_section_count: u32,
    /// Offset of the relocation instructions from the start of the loader section
    pub reloc_instr_offset: u32,
    /// Offset of the loader string table from the start of the loader section
    pub loader_strings_offset: u32,
    /// Offset of the export hash table from the start of the loader section
    pub export_hash_offset: u32,
    /// Power of two giving the number of export hash slots
    pub export_hash_table_power: u32,
    /// Number of exported symbols
    pub exported_symbol_count: u32,
}

impl LoaderHeader {
    /// Parse the loader header at the parser's position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the section is too short.
    pub fn read(parser: &mut Parser) -> Result<LoaderHeader> {
        Ok(LoaderHeader {
            main_section: parser.read_be::<i32>()?,
            main_offset: parser.read_be::<u32>()?,
            init_section: parser.read_be::<i32>()?,
            init_offset: parser.read_be::<u32>()?,
            term_section: parser.read_be::<i32>()?,
            term_offset: parser.read_be::<u32>()?,
            imported_library_count: parser.read_be::<u32>()?,
            total_imported_symbol_count: parser.read_be::<u32>()?,
            reloc_section_count: parser.read_be::<u32>()?,
            reloc_instr_offset: parser.read_be::<u32>()?,
            loader_strings_offset: parser.read_be::<u32>()?,
            export_hash_offset: parser.read_be::<u32>()?,
            export_hash_table_power: parser.read_be::<u32>()?,
            exported_symbol_count: parser.read_be::<u32>()?,
        })
    }
}

/// One symbol imported by the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedSymbol {
    /// Symbol name from the loader string table
    pub name: String,
    /// What the symbol refers to
    pub class: SymbolClass,
    /// Import flags
    pub flags: SymbolFlags,
}

impl ImportedSymbol {
    /// True if the container tolerates this symbol being missing.
    #[must_use]
    pub fn is_weak(&self) -> bool {
        self.flags.contains(SymbolFlags::WEAK)
    }
}

/// A library the container imports from, with its symbols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedLibrary {
    /// Library name, as matched against the library registry
    pub name: String,
    /// Oldest implementation version that is compatible
    pub old_imp_version: u32,
    /// Version the container was linked against
    pub current_version: u32,
    /// Import options
    pub options: LibraryOptions,
    /// Index of the first symbol in the container-wide import table
    pub first_imported_symbol: u32,
    /// Symbols imported from this library
    pub symbols: Vec<ImportedSymbol>,
}

/// Parsed contents of a loader section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderInfo {
    /// The fixed header
    pub header: LoaderHeader,
    /// Imported libraries in declaration order
    pub libraries: Vec<ImportedLibrary>,
}

impl LoaderInfo {
    /// Parse a loader section image.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a library's symbol range or a symbol class is
    /// invalid, and [`crate::Error::OutOfBounds`] if a table runs past the section.
    pub fn read(data: &[u8]) -> Result<LoaderInfo> {
        let mut parser = Parser::new(data);
        let header = LoaderHeader::read(&mut parser)?;

        let symbol_table = (header.imported_library_count as usize)
            .checked_mul(IMPORTED_LIBRARY_SIZE)
            .and_then(|size| size.checked_add(LOADER_HEADER_SIZE))
            .ok_or(out_of_bounds_error!())?;
        let strings = header.loader_strings_offset as usize;

        let mut libraries = Vec::with_capacity(header.imported_library_count.min(256) as usize);
        for _ in 0..header.imported_library_count {
            let name_offset = parser.read_be::<u32>()?;
            let old_imp_version = parser.read_be::<u32>()?;
            let current_version = parser.read_be::<u32>()?;
            let symbol_count = parser.read_be::<u32>()?;
            let first_imported_symbol = parser.read_be::<u32>()?;
            let options = LibraryOptions::from_bits_retain(parser.read_be::<u8>()?);
            // reserved
            parser.advance_by(3)?;

            let in_range = first_imported_symbol
                .checked_add(symbol_count)
                .is_some_and(|end| end <= header.total_imported_symbol_count);
            if !in_range {
                return Err(malformed_error!(
                    "Imported library symbols {}+{} exceed the {} imported symbols",
                    first_imported_symbol,
                    symbol_count,
                    header.total_imported_symbol_count
                ));
            }

            let name = read_string(data, strings, name_offset)?;
            let mut symbols = Vec::with_capacity(symbol_count.min(4096) as usize);
            for index in first_imported_symbol..first_imported_symbol + symbol_count {
                symbols.push(read_symbol(data, symbol_table, strings, index)?);
            }

            libraries.push(ImportedLibrary {
                name,
                old_imp_version,
                current_version,
                options,
                first_imported_symbol,
                symbols,
            });
        }

        Ok(LoaderInfo { header, libraries })
    }

    /// Iterate all imported symbols with the library they come from.
    pub fn imports(&self) -> impl Iterator<Item = (&ImportedLibrary, &ImportedSymbol)> {
        self.libraries
            .iter()
            .flat_map(|library| library.symbols.iter().map(move |symbol| (library, symbol)))
    }
}

fn read_symbol(data: &[u8], table: usize, strings: usize, index: u32) -> Result<ImportedSymbol> {
    let mut parser = Parser::new(data);
    let position = (index as usize)
        .checked_mul(4)
        .and_then(|offset| offset.checked_add(table))
        .ok_or(out_of_bounds_error!())?;
    parser.seek(position)?;

    let entry = parser.read_be::<u32>()?;
    let class_byte = (entry >> 24) as u8;
    let Some(class) = SymbolClass::from_bits(class_byte) else {
        return Err(malformed_error!(
            "Imported symbol {} has invalid class 0x{:02X}",
            index,
            class_byte
        ));
    };

    Ok(ImportedSymbol {
        name: read_string(data, strings, entry & 0x00FF_FFFF)?,
        class,
        flags: SymbolFlags::from_bits_truncate(class_byte),
    })
}

fn read_string(data: &[u8], strings: usize, offset: u32) -> Result<String> {
    let position = strings
        .checked_add(offset as usize)
        .ok_or(out_of_bounds_error!())?;

    let mut parser = Parser::new(data);
    parser.seek(position)?;
    Ok(parser.read_cstring())
}
