//! PEF container loading.
//!
//! [`Container`] parses the container header and section table of a PEF file, validates
//! that every table lies inside the file, and instantiates the container's sections into
//! owned buffers. Any failure aborts the whole load; the error names the section that
//! caused it.
//!
//! # Architecture
//!
//! - [`header`] - container and section header tables
//! - [`pattern`] - pattern-initialization bytecode
//! - [`section`] - section instantiation
//! - [`loader`] - loader-section import tables
//! - [`builder`] - container synthesis for tooling and tests
//!
//! # Examples
//!
//! ```rust,no_run
//! use pefrun::{container::LoaderConfig, Container};
//! use std::path::Path;
//!
//! let config = LoaderConfig::new().keep_raw_sections(false);
//! let container = Container::from_file_with_config(Path::new("SimpleText"), config)?;
//!
//! for section in container.sections() {
//!     println!("{:<12} {:>8} bytes", section.name(), section.len());
//! }
//! if let Some(loader) = container.loader_info()? {
//!     for (library, symbol) in loader.imports() {
//!         println!("{}::{}", library.name, symbol.name);
//!     }
//! }
//! # Ok::<(), pefrun::Error>(())
//! ```

pub mod builder;
pub mod header;
pub mod loader;
pub mod pattern;
pub mod section;

pub use builder::{ContainerBuilder, LoaderSectionBuilder, SectionSpec};
pub use header::{Architecture, ContainerHeader, SectionHeader, SectionKind, ShareKind};
pub use loader::{ImportedLibrary, ImportedSymbol, LoaderInfo, SymbolClass};
pub use section::Section;

use std::path::Path;

use log::info;

use crate::{
    file::{parser::Parser, File},
    Error::{self, CorruptContainer},
    Result,
};

/// Controls which sections a [`Container`] materializes.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Instantiate every section of an instantiable kind, not only the leading
    /// instantiated sections declared by the container header.
    pub instantiate_all: bool,

    /// Keep sections that are not instantiated, such as the loader section, as raw copies
    /// of their container bytes so that section indices match the header table.
    pub keep_raw_sections: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            instantiate_all: false,
            keep_raw_sections: true,
        }
    }
}

impl LoaderConfig {
    /// Creates a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate instantiable sections past the header's instantiated count.
    #[must_use]
    pub fn instantiate_all(mut self, enabled: bool) -> Self {
        self.instantiate_all = enabled;
        self
    }

    /// Keep non-instantiated sections as raw copies.
    #[must_use]
    pub fn keep_raw_sections(mut self, enabled: bool) -> Self {
        self.keep_raw_sections = enabled;
        self
    }
}

/// A loaded PEF container.
pub struct Container {
    file: File,
    header: ContainerHeader,
    section_headers: Vec<SectionHeader>,
    sections: Vec<Section>,
}

impl Container {
    /// Load a container from disk with the default configuration.
    ///
    /// # Errors
    /// See [`Container::from_mem_with_config`]; I/O failures are [`crate::Error::FileError`].
    pub fn from_file(path: &Path) -> Result<Container> {
        Self::from_file_with_config(path, LoaderConfig::default())
    }

    /// Load a container from disk.
    ///
    /// # Errors
    /// See [`Container::from_mem_with_config`]; I/O failures are [`crate::Error::FileError`].
    pub fn from_file_with_config(path: &Path, config: LoaderConfig) -> Result<Container> {
        Self::load(File::from_file(path)?, &config)
    }

    /// Load a container from an in-memory buffer with the default configuration.
    ///
    /// # Errors
    /// See [`Container::from_mem_with_config`].
    pub fn from_mem(data: Vec<u8>) -> Result<Container> {
        Self::from_mem_with_config(data, LoaderConfig::default())
    }

    /// Load a container from an in-memory buffer.
    ///
    /// # Errors
    /// - [`crate::Error::NotSupported`] for a non-PEF or unsupported container
    /// - [`crate::Error::CorruptContainer`] if the header tables run past the data
    /// - [`crate::Error::Section`] wrapping the first section that failed to load
    pub fn from_mem_with_config(data: Vec<u8>, config: LoaderConfig) -> Result<Container> {
        Self::load(File::from_mem(data)?, &config)
    }

    fn load(file: File, config: &LoaderConfig) -> Result<Container> {
        let data = file.data();
        let header = ContainerHeader::read(data)?;

        let name_table = header.name_table_offset();
        if name_table > data.len() {
            return Err(CorruptContainer(format!(
                "{} section headers run past the {}-byte container",
                header.section_count,
                data.len()
            )));
        }

        let mut parser = Parser::new(data);
        parser.seek(header::CONTAINER_HEADER_SIZE)?;
        let mut section_headers = Vec::with_capacity(usize::from(header.section_count));
        for _ in 0..header.section_count {
            section_headers.push(SectionHeader::read(&mut parser)?);
        }

        let mut sections = Vec::with_capacity(section_headers.len());
        for (index, section_header) in section_headers.iter().enumerate() {
            let name = section_header.name(data, name_table);
            let instantiated = index < usize::from(header.inst_section_count)
                || (config.instantiate_all && section_header.section_kind.is_instantiable());

            let result = if instantiated {
                Section::instantiate(section_header, &name, data)
            } else if config.keep_raw_sections {
                Section::raw(section_header, &name, data)
            } else {
                continue;
            };

            sections.push(result.map_err(|source| Error::Section {
                index,
                name,
                source: Box::new(source),
            })?);
        }

        info!(
            "Loaded {} container: {} sections, {} instantiated",
            header.architecture,
            header.section_count,
            header.inst_section_count
        );

        Ok(Container {
            file,
            header,
            section_headers,
            sections,
        })
    }

    /// The container header.
    #[must_use]
    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Every section header, in table order.
    #[must_use]
    pub fn section_headers(&self) -> &[SectionHeader] {
        &self.section_headers
    }

    /// The loaded sections, in table order.
    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Mutable access to the loaded sections.
    pub fn sections_mut(&mut self) -> &mut [Section] {
        &mut self.sections
    }

    /// Hand the loaded sections to the caller, dropping the container bytes.
    #[must_use]
    pub fn into_sections(self) -> Vec<Section> {
        self.sections
    }

    /// Find a loaded section by name.
    #[must_use]
    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|section| section.name() == name)
    }

    /// The raw container bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.file.data()
    }

    /// Parse the container's loader section, if it has one.
    ///
    /// # Errors
    /// Returns [`crate::Error::CorruptContainer`] if the loader section runs past the
    /// container, or a parse error from [`LoaderInfo::read`].
    pub fn loader_info(&self) -> Result<Option<LoaderInfo>> {
        let Some(loader) = self
            .section_headers
            .iter()
            .find(|header| header.section_kind == SectionKind::Loader)
        else {
            return Ok(None);
        };

        let offset = loader.container_offset as usize;
        let length = loader.container_length as usize;
        let data = self.file.data_slice(offset, length).map_err(|_| {
            CorruptContainer(format!(
                "loader section at 0x{offset:X} (+{length}) runs past the container"
            ))
        })?;

        LoaderInfo::read(data).map(Some)
    }
}
