//! Container and section header parsing.
//!
//! A PEF container starts with a fixed 40-byte header, followed by one 28-byte header per
//! section and then the section name table. All fields are big-endian.
//!
//! # Reference
//! - Mac OS Runtime Architectures, chapter 8 ("PEF Structure")

use std::fmt;

use crate::{file::parser::Parser, Error::NotSupported, Result};

/// First container tag, `Joy!`.
pub const PEF_TAG1: u32 = 0x4A6F_7921;
/// Second container tag, `peff`.
pub const PEF_TAG2: u32 = 0x7065_6666;
/// The only container format version ever shipped.
pub const PEF_VERSION: u32 = 1;

/// Size of the container header in bytes.
pub const CONTAINER_HEADER_SIZE: usize = 40;
/// Size of one section header in bytes.
pub const SECTION_HEADER_SIZE: usize = 28;

/// Instruction set a container was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// `pwpc`
    PowerPC,
    /// `m68k`
    M68k,
}

impl Architecture {
    const PWPC: u32 = 0x7077_7063;
    const M68K: u32 = 0x6D36_386B;

    /// Parse the 4-character architecture tag.
    #[must_use]
    pub fn from_tag(tag: u32) -> Option<Architecture> {
        match tag {
            Self::PWPC => Some(Architecture::PowerPC),
            Self::M68K => Some(Architecture::M68k),
            _ => None,
        }
    }

    /// The on-disk tag for this architecture.
    #[must_use]
    pub fn tag(self) -> u32 {
        match self {
            Architecture::PowerPC => Self::PWPC,
            Architecture::M68k => Self::M68K,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::PowerPC => write!(f, "pwpc"),
            Architecture::M68k => write!(f, "m68k"),
        }
    }
}

/// The header at offset 0 of every PEF container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    /// Target architecture
    pub architecture: Architecture,
    /// Format version, always [`PEF_VERSION`]
    pub format_version: u32,
    /// Creation time in Mac OS epoch seconds
    pub date_time_stamp: u32,
    /// Oldest version this container is definition-compatible with
    pub old_def_version: u32,
    /// Oldest version this container is implementation-compatible with
    pub old_imp_version: u32,
    /// Version of this container
    pub current_version: u32,
    /// Total number of section headers
    pub section_count: u16,
    /// Number of leading sections that are instantiated at load time
    pub inst_section_count: u16,
}

impl ContainerHeader {
    /// Parse a container header from the start of `data`.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotSupported`] for a wrong tag, architecture or version, and
    /// [`crate::Error::CorruptContainer`] if the data is shorter than a header.
    pub fn read(data: &[u8]) -> Result<ContainerHeader> {
        if data.len() < CONTAINER_HEADER_SIZE {
            return Err(crate::Error::CorruptContainer(format!(
                "container is {} bytes, header needs {}",
                data.len(),
                CONTAINER_HEADER_SIZE
            )));
        }

        let mut parser = Parser::new(data);
        if parser.read_be::<u32>()? != PEF_TAG1 || parser.read_be::<u32>()? != PEF_TAG2 {
            return Err(NotSupported);
        }

        let Some(architecture) = Architecture::from_tag(parser.read_be::<u32>()?) else {
            return Err(NotSupported);
        };

        let format_version = parser.read_be::<u32>()?;
        if format_version != PEF_VERSION {
            return Err(NotSupported);
        }

        let date_time_stamp = parser.read_be::<u32>()?;
        let old_def_version = parser.read_be::<u32>()?;
        let old_imp_version = parser.read_be::<u32>()?;
        let current_version = parser.read_be::<u32>()?;
        let section_count = parser.read_be::<u16>()?;
        let inst_section_count = parser.read_be::<u16>()?;
        // reserved
        parser.advance_by(4)?;

        if inst_section_count > section_count {
            return Err(malformed_error!(
                "{} instantiated sections declared but only {} sections exist",
                inst_section_count,
                section_count
            ));
        }

        Ok(ContainerHeader {
            architecture,
            format_version,
            date_time_stamp,
            old_def_version,
            old_imp_version,
            current_version,
            section_count,
            inst_section_count,
        })
    }

    /// Offset of the first byte after the section header table, where the name table starts.
    #[must_use]
    pub fn name_table_offset(&self) -> usize {
        CONTAINER_HEADER_SIZE + usize::from(self.section_count) * SECTION_HEADER_SIZE
    }
}

/// What a section contains and how it is instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Executable code, copied verbatim
    Code,
    /// Data stored uncompressed
    UnpackedData,
    /// Data stored as pattern-initialization bytecode
    PatternInitializedData,
    /// Read-only data, copied verbatim
    Constant,
    /// Loader information: imports, exports and relocations
    Loader,
    /// Reserved for debuggers
    Debug,
    /// Code that may also be written to
    ExecutableData,
    /// Reserved for exception handling
    Exception,
    /// Reserved for traceback tables
    Traceback,
    /// Kind byte outside the documented set
    Unknown(u8),
}

impl SectionKind {
    /// True for kinds copied byte for byte from the container.
    #[must_use]
    pub fn is_raw(self) -> bool {
        matches!(
            self,
            SectionKind::Code
                | SectionKind::UnpackedData
                | SectionKind::Constant
                | SectionKind::ExecutableData
        )
    }

    /// True for kinds the section instantiator can place into memory.
    #[must_use]
    pub fn is_instantiable(self) -> bool {
        self.is_raw() || self == SectionKind::PatternInitializedData
    }

    /// The on-disk kind byte.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            SectionKind::Code => 0,
            SectionKind::UnpackedData => 1,
            SectionKind::PatternInitializedData => 2,
            SectionKind::Constant => 3,
            SectionKind::Loader => 4,
            SectionKind::Debug => 5,
            SectionKind::ExecutableData => 6,
            SectionKind::Exception => 7,
            SectionKind::Traceback => 8,
            SectionKind::Unknown(value) => value,
        }
    }
}

impl From<u8> for SectionKind {
    fn from(value: u8) -> Self {
        match value {
            0 => SectionKind::Code,
            1 => SectionKind::UnpackedData,
            2 => SectionKind::PatternInitializedData,
            3 => SectionKind::Constant,
            4 => SectionKind::Loader,
            5 => SectionKind::Debug,
            6 => SectionKind::ExecutableData,
            7 => SectionKind::Exception,
            8 => SectionKind::Traceback,
            other => SectionKind::Unknown(other),
        }
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SectionKind::Code => "Code",
            SectionKind::UnpackedData => "UnpackedData",
            SectionKind::PatternInitializedData => "PatternInitializedData",
            SectionKind::Constant => "Constant",
            SectionKind::Loader => "Loader",
            SectionKind::Debug => "Debug",
            SectionKind::ExecutableData => "ExecutableData",
            SectionKind::Exception => "Exception",
            SectionKind::Traceback => "Traceback",
            SectionKind::Unknown(value) => return f.pad(&format!("Unknown({value})")),
        };
        f.pad(name)
    }
}

/// How an instantiated section is shared between processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareKind {
    /// One copy per process
    ProcessShare,
    /// One copy for the whole system
    GlobalShare,
    /// One copy for the whole system, writable only in privileged mode
    ProtectedShare,
    /// Share byte outside the documented set
    Unknown(u8),
}

impl ShareKind {
    /// The on-disk share byte.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            ShareKind::ProcessShare => 1,
            ShareKind::GlobalShare => 4,
            ShareKind::ProtectedShare => 5,
            ShareKind::Unknown(value) => value,
        }
    }
}

impl From<u8> for ShareKind {
    fn from(value: u8) -> Self {
        match value {
            1 => ShareKind::ProcessShare,
            4 => ShareKind::GlobalShare,
            5 => ShareKind::ProtectedShare,
            other => ShareKind::Unknown(other),
        }
    }
}

impl fmt::Display for ShareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShareKind::ProcessShare => write!(f, "Process"),
            ShareKind::GlobalShare => write!(f, "Global"),
            ShareKind::ProtectedShare => write!(f, "Protected"),
            ShareKind::Unknown(value) => write!(f, "Unknown({value})"),
        }
    }
}

/// One entry of the section header table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    /// Offset into the name table, `-1` for an unnamed section
    pub name_offset: i32,
    /// Preferred load address, usually 0
    pub default_address: u32,
    /// Size of the section once instantiated (execution size)
    pub total_length: u32,
    /// Size of the initialized part of the section
    pub unpacked_length: u32,
    /// Size of the section's bytes inside the container (packed size)
    pub container_length: u32,
    /// Offset of the section's bytes from the start of the container
    pub container_offset: u32,
    /// Section kind
    pub section_kind: SectionKind,
    /// Share kind
    pub share_kind: ShareKind,
    /// Alignment as a power of two
    pub alignment: u8,
}

impl SectionHeader {
    /// Parse one section header at the parser's position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than 28 bytes remain.
    pub fn read(parser: &mut Parser) -> Result<SectionHeader> {
        let name_offset = parser.read_be::<i32>()?;
        let default_address = parser.read_be::<u32>()?;
        let total_length = parser.read_be::<u32>()?;
        let unpacked_length = parser.read_be::<u32>()?;
        let container_length = parser.read_be::<u32>()?;
        let container_offset = parser.read_be::<u32>()?;
        let section_kind = SectionKind::from(parser.read_be::<u8>()?);
        let share_kind = ShareKind::from(parser.read_be::<u8>()?);
        let alignment = parser.read_be::<u8>()?;
        // reserved
        parser.advance_by(1)?;

        Ok(SectionHeader {
            name_offset,
            default_address,
            total_length,
            unpacked_length,
            container_length,
            container_offset,
            section_kind,
            share_kind,
            alignment,
        })
    }

    /// The declared alignment in bytes, or `None` if the exponent does not fit a `u32`.
    #[must_use]
    pub fn alignment_bytes(&self) -> Option<u32> {
        1u32.checked_shl(u32::from(self.alignment))
    }

    /// Resolve this section's name against the name table.
    ///
    /// Unnamed sections and offsets past the end of the container yield an empty string.
    #[must_use]
    pub fn name(&self, data: &[u8], name_table_offset: usize) -> String {
        let Ok(offset) = usize::try_from(self.name_offset) else {
            return String::new();
        };
        let Some(start) = name_table_offset.checked_add(offset) else {
            return String::new();
        };

        let mut parser = Parser::new(data);
        if parser.seek(start).is_err() {
            return String::new();
        }
        parser.read_cstring()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn header_bytes(arch: &[u8; 4], version: u32, sections: u16, inst: u16) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"Joy!peff");
        data.extend_from_slice(arch);
        data.extend_from_slice(&version.to_be_bytes());
        data.extend_from_slice(&0xB0A1_2345u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&3u32.to_be_bytes());
        data.extend_from_slice(&sections.to_be_bytes());
        data.extend_from_slice(&inst.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data
    }

    #[test]
    fn crafted() {
        let data = header_bytes(b"pwpc", 1, 3, 2);
        let header = ContainerHeader::read(&data).unwrap();

        assert_eq!(header.architecture, Architecture::PowerPC);
        assert_eq!(header.date_time_stamp, 0xB0A1_2345);
        assert_eq!(header.current_version, 3);
        assert_eq!(header.section_count, 3);
        assert_eq!(header.inst_section_count, 2);
        assert_eq!(header.name_table_offset(), 40 + 3 * 28);
    }

    #[test]
    fn rejects_foreign_containers() {
        let mut data = header_bytes(b"pwpc", 1, 1, 1);
        data[0] = b'X';
        assert!(matches!(ContainerHeader::read(&data), Err(NotSupported)));

        let data = header_bytes(b"x86 ", 1, 1, 1);
        assert!(matches!(ContainerHeader::read(&data), Err(NotSupported)));

        let data = header_bytes(b"m68k", 2, 1, 1);
        assert!(matches!(ContainerHeader::read(&data), Err(NotSupported)));

        let data = header_bytes(b"pwpc", 1, 1, 1);
        assert!(matches!(
            ContainerHeader::read(&data[..39]),
            Err(Error::CorruptContainer(_))
        ));
    }

    #[test]
    fn more_instantiated_than_total() {
        let data = header_bytes(b"pwpc", 1, 1, 2);
        assert!(matches!(
            ContainerHeader::read(&data),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn section_header() {
        let mut data = Vec::new();
        data.extend_from_slice(&5i32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&0x200u32.to_be_bytes());
        data.extend_from_slice(&0x180u32.to_be_bytes());
        data.extend_from_slice(&0x40u32.to_be_bytes());
        data.extend_from_slice(&0x1000u32.to_be_bytes());
        data.extend_from_slice(&[2, 1, 4, 0]);

        let mut parser = Parser::new(&data);
        let header = SectionHeader::read(&mut parser).unwrap();
        assert_eq!(parser.pos(), SECTION_HEADER_SIZE);
        assert_eq!(header.name_offset, 5);
        assert_eq!(header.total_length, 0x200);
        assert_eq!(header.unpacked_length, 0x180);
        assert_eq!(header.container_length, 0x40);
        assert_eq!(header.container_offset, 0x1000);
        assert_eq!(header.section_kind, SectionKind::PatternInitializedData);
        assert_eq!(header.share_kind, ShareKind::ProcessShare);
        assert_eq!(header.alignment_bytes(), Some(16));

        assert!(SectionHeader::read(&mut Parser::new(&data[..27])).is_err());
    }

    #[test]
    fn section_names() {
        let names = b"code\0data\0";
        let header = SectionHeader {
            name_offset: 5,
            default_address: 0,
            total_length: 0,
            unpacked_length: 0,
            container_length: 0,
            container_offset: 0,
            section_kind: SectionKind::UnpackedData,
            share_kind: ShareKind::ProcessShare,
            alignment: 4,
        };
        assert_eq!(header.name(names, 0), "data");

        let unnamed = SectionHeader {
            name_offset: -1,
            ..header.clone()
        };
        assert_eq!(unnamed.name(names, 0), "");

        let dangling = SectionHeader {
            name_offset: 100,
            ..header
        };
        assert_eq!(dangling.name(names, 0), "");
    }

    #[test]
    fn kinds() {
        for value in 0..=255u8 {
            assert_eq!(SectionKind::from(value).to_u8(), value);
            assert_eq!(ShareKind::from(value).to_u8(), value);
        }
        assert!(SectionKind::Code.is_raw());
        assert!(!SectionKind::PatternInitializedData.is_raw());
        assert!(SectionKind::PatternInitializedData.is_instantiable());
        assert!(!SectionKind::Loader.is_instantiable());
        assert_eq!(SectionKind::Unknown(42).to_string(), "Unknown(42)");
    }
}
