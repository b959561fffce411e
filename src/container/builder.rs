//! Container synthesis for tooling and tests.
//!
//! [`ContainerBuilder`] lays out a well-formed PEF container from section images, and
//! [`LoaderSectionBuilder`] produces the import tables of a loader section. Both emit the
//! exact on-disk layout that [`crate::Container`] parses.
//!
//! # Examples
//!
//! ```rust
//! use pefrun::container::{ContainerBuilder, SectionKind};
//! use pefrun::Container;
//!
//! let mut builder = ContainerBuilder::new();
//! builder.section("code", SectionKind::Code, vec![0x4E, 0x80, 0x00, 0x20]);
//! let bytes = builder.build();
//!
//! let container = Container::from_mem(bytes)?;
//! assert_eq!(container.sections()[0].name(), "code");
//! # Ok::<(), pefrun::Error>(())
//! ```

use crate::{
    container::{
        header::{
            Architecture, SectionKind, ShareKind, CONTAINER_HEADER_SIZE, PEF_TAG1, PEF_TAG2,
            PEF_VERSION, SECTION_HEADER_SIZE,
        },
        loader::{SymbolClass, SymbolFlags, IMPORTED_LIBRARY_SIZE, LOADER_HEADER_SIZE},
    },
    file::io::write_be_at,
    Result,
};

const DATA_ALIGNMENT: usize = 16;

/// Description of one section to be placed in a container.
#[derive(Debug, Clone)]
pub struct SectionSpec {
    /// Section name, `None` for unnamed sections
    pub name: Option<String>,
    /// Section kind
    pub kind: SectionKind,
    /// Share kind
    pub share: ShareKind,
    /// Alignment exponent
    pub alignment: u8,
    /// Preferred load address
    pub default_address: u32,
    /// Bytes stored in the container
    pub packed: Vec<u8>,
    /// Initialized length after instantiation
    pub unpacked_length: u32,
    /// Total length after instantiation
    pub total_length: u32,
}

impl SectionSpec {
    /// A section whose image is `data` verbatim.
    #[must_use]
    pub fn raw(name: &str, kind: SectionKind, data: Vec<u8>) -> SectionSpec {
        let length = u32::try_from(data.len()).unwrap_or(u32::MAX);
        SectionSpec {
            name: Some(name.to_string()),
            kind,
            share: ShareKind::ProcessShare,
            alignment: 4,
            default_address: 0,
            packed: data,
            unpacked_length: length,
            total_length: length,
        }
    }

    /// A pattern-initialized data section.
    #[must_use]
    pub fn pattern(name: &str, packed: Vec<u8>, unpacked_length: u32, total_length: u32) -> SectionSpec {
        SectionSpec {
            name: Some(name.to_string()),
            kind: SectionKind::PatternInitializedData,
            share: ShareKind::ProcessShare,
            alignment: 4,
            default_address: 0,
            packed,
            unpacked_length,
            total_length,
        }
    }
}

/// Lays out a PEF container.
#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    architecture: Architecture,
    date_time_stamp: u32,
    current_version: u32,
    instantiated: Option<u16>,
    sections: Vec<SectionSpec>,
}

impl Default for ContainerBuilder {
    fn default() -> Self {
        ContainerBuilder {
            architecture: Architecture::PowerPC,
            date_time_stamp: 0,
            current_version: 0,
            instantiated: None,
            sections: Vec::new(),
        }
    }
}

impl ContainerBuilder {
    /// A PowerPC container with no sections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target architecture.
    pub fn architecture(&mut self, architecture: Architecture) -> &mut Self {
        self.architecture = architecture;
        self
    }

    /// Set the creation timestamp.
    pub fn date_time_stamp(&mut self, stamp: u32) -> &mut Self {
        self.date_time_stamp = stamp;
        self
    }

    /// Set the container version.
    pub fn current_version(&mut self, version: u32) -> &mut Self {
        self.current_version = version;
        self
    }

    /// Override the instantiated-section count.
    ///
    /// By default every section of an instantiable kind is counted; such sections must then
    /// be added before the others.
    pub fn instantiated_count(&mut self, count: u16) -> &mut Self {
        self.instantiated = Some(count);
        self
    }

    /// Add a section stored verbatim.
    pub fn section(&mut self, name: &str, kind: SectionKind, data: Vec<u8>) -> &mut Self {
        self.sections.push(SectionSpec::raw(name, kind, data));
        self
    }

    /// Add a fully specified section.
    pub fn add(&mut self, spec: SectionSpec) -> &mut Self {
        self.sections.push(spec);
        self
    }

    /// Number of sections added so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// True if no section has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Emit the container bytes.
    ///
    /// Section data is placed after the name table, each section starting on a 16-byte
    /// boundary.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let section_count = u16::try_from(self.sections.len()).unwrap_or(u16::MAX);
        let instantiated = self.instantiated.unwrap_or_else(|| {
            let count = self
                .sections
                .iter()
                .filter(|spec| spec.kind.is_instantiable())
                .count();
            u16::try_from(count).unwrap_or(u16::MAX)
        });

        let mut names = Vec::new();
        let mut name_offsets = Vec::with_capacity(self.sections.len());
        for spec in &self.sections {
            match &spec.name {
                Some(name) => {
                    name_offsets.push(i32::try_from(names.len()).unwrap_or(-1));
                    names.extend_from_slice(name.as_bytes());
                    names.push(0);
                }
                None => name_offsets.push(-1),
            }
        }

        let name_table = CONTAINER_HEADER_SIZE + self.sections.len() * SECTION_HEADER_SIZE;
        let mut data_offsets = Vec::with_capacity(self.sections.len());
        let mut cursor = align_up(name_table + names.len());
        for spec in &self.sections {
            data_offsets.push(cursor);
            cursor = align_up(cursor + spec.packed.len());
        }

        let mut out = vec![0u8; cursor];
        let mut offset = 0;
        write(&mut out, &mut offset, PEF_TAG1);
        write(&mut out, &mut offset, PEF_TAG2);
        write(&mut out, &mut offset, self.architecture.tag());
        write(&mut out, &mut offset, PEF_VERSION);
        write(&mut out, &mut offset, self.date_time_stamp);
        write(&mut out, &mut offset, 0u32);
        write(&mut out, &mut offset, 0u32);
        write(&mut out, &mut offset, self.current_version);
        write(&mut out, &mut offset, section_count);
        write(&mut out, &mut offset, instantiated);
        write(&mut out, &mut offset, 0u32);

        for ((spec, name_offset), data_offset) in
            self.sections.iter().zip(&name_offsets).zip(&data_offsets)
        {
            write(&mut out, &mut offset, *name_offset);
            write(&mut out, &mut offset, spec.default_address);
            write(&mut out, &mut offset, spec.total_length);
            write(&mut out, &mut offset, spec.unpacked_length);
            write(&mut out, &mut offset, to_u32(spec.packed.len()));
            write(&mut out, &mut offset, to_u32(*data_offset));
            write(&mut out, &mut offset, spec.kind.to_u8());
            write(&mut out, &mut offset, spec.share.to_u8());
            write(&mut out, &mut offset, spec.alignment);
            write(&mut out, &mut offset, 0u8);
        }

        out[name_table..name_table + names.len()].copy_from_slice(&names);
        for (spec, data_offset) in self.sections.iter().zip(&data_offsets) {
            out[*data_offset..*data_offset + spec.packed.len()].copy_from_slice(&spec.packed);
        }

        out
    }
}

/// Builds the import tables of a loader section.
///
/// Entry points are left unset (-1), and the relocation and export tables are empty.
#[derive(Debug, Clone, Default)]
pub struct LoaderSectionBuilder {
    libraries: Vec<(String, Vec<(String, SymbolClass, SymbolFlags)>)>,
}

impl LoaderSectionBuilder {
    /// A loader section with no imports.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Import `symbols` from `library`.
    pub fn import(&mut self, library: &str, symbols: &[(&str, SymbolClass, bool)]) -> &mut Self {
        let symbols = symbols
            .iter()
            .map(|(name, class, weak)| {
                let flags = if *weak {
                    SymbolFlags::WEAK
                } else {
                    SymbolFlags::empty()
                };
                ((*name).to_string(), *class, flags)
            })
            .collect();
        self.libraries.push((library.to_string(), symbols));
        self
    }

    /// Emit the loader section bytes.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let symbol_count: usize = self.libraries.iter().map(|(_, symbols)| symbols.len()).sum();
        let symbols_offset = LOADER_HEADER_SIZE + self.libraries.len() * IMPORTED_LIBRARY_SIZE;
        let strings_offset = symbols_offset + symbol_count * 4;

        let mut strings = Vec::new();
        let mut intern = |name: &str| {
            let offset = to_u32(strings.len());
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
            offset
        };

        let mut library_table = Vec::new();
        let mut symbol_table = Vec::new();
        let mut first = 0u32;
        for (name, symbols) in &self.libraries {
            library_table.push((intern(name), first, to_u32(symbols.len())));
            for (symbol, class, flags) in symbols {
                let class_byte = *class as u8 | flags.bits();
                symbol_table.push(u32::from(class_byte) << 24 | intern(symbol));
            }
            first += to_u32(symbols.len());
        }

        let total = strings_offset + strings.len();
        let mut out = vec![0u8; total];
        let mut offset = 0;
        for _ in 0..3 {
            write(&mut out, &mut offset, -1i32);
            write(&mut out, &mut offset, 0u32);
        }
        write(&mut out, &mut offset, to_u32(self.libraries.len()));
        write(&mut out, &mut offset, to_u32(symbol_count));
        write(&mut out, &mut offset, 0u32);
        write(&mut out, &mut offset, to_u32(total));
        write(&mut out, &mut offset, to_u32(strings_offset));
        write(&mut out, &mut offset, to_u32(total));
        write(&mut out, &mut offset, 0u32);
        write(&mut out, &mut offset, 0u32);

        for (name_offset, first, count) in library_table {
            write(&mut out, &mut offset, name_offset);
            write(&mut out, &mut offset, 0u32);
            write(&mut out, &mut offset, 0u32);
            write(&mut out, &mut offset, count);
            write(&mut out, &mut offset, first);
            write(&mut out, &mut offset, 0u32);
        }
        for entry in symbol_table {
            write(&mut out, &mut offset, entry);
        }
        out[strings_offset..].copy_from_slice(&strings);

        out
    }
}

fn write<T: crate::file::io::PefIO>(out: &mut [u8], offset: &mut usize, value: T) {
    let result: Result<()> = write_be_at(out, offset, value);
    debug_assert!(result.is_ok(), "builder layout is sized before writing");
}

fn align_up(value: usize) -> usize {
    value.div_ceil(DATA_ALIGNMENT) * DATA_ALIGNMENT
}

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{header::ContainerHeader, loader::LoaderInfo};

    #[test]
    fn layout() {
        let mut builder = ContainerBuilder::new();
        builder
            .current_version(7)
            .section("code", SectionKind::Code, vec![1; 20])
            .add(SectionSpec {
                name: None,
                ..SectionSpec::raw("", SectionKind::Loader, vec![2; 8])
            });
        let data = builder.build();

        let header = ContainerHeader::read(&data).unwrap();
        assert_eq!(header.current_version, 7);
        assert_eq!(header.section_count, 2);
        assert_eq!(header.inst_section_count, 1);

        // Name table then 16-byte aligned section data
        let names = header.name_table_offset();
        assert_eq!(&data[names..names + 5], b"code\0");
        assert_eq!(data.len() % 16, 0);
        assert_eq!(data[112], 1);
        assert_eq!(data[144], 2);
        assert_eq!(data.len(), 160);
    }

    #[test]
    fn loader_section() {
        let mut builder = LoaderSectionBuilder::new();
        builder.import("StdCLib", &[("puts", SymbolClass::TVector, false)]);
        let info = LoaderInfo::read(&builder.build()).unwrap();
        assert_eq!(info.libraries.len(), 1);
        assert_eq!(info.libraries[0].symbols[0].name, "puts");
    }
}
