//! Instantiated container sections.
//!
//! A [`Section`] owns the in-memory image of one section, sized to the section's execution
//! length. Raw kinds are copied verbatim from the container; pattern-initialized data is
//! expanded through [`crate::container::pattern`] and the tail past the unpacked length is
//! zero-filled.

use log::debug;

use crate::{
    container::{
        header::{SectionHeader, SectionKind, ShareKind},
        pattern,
    },
    Error::{AlignmentViolation, CorruptContainer, UnsupportedSectionType},
    Result,
};

/// Minimum alignment in bytes for sections copied verbatim.
pub const RAW_SECTION_ALIGNMENT: u32 = 16;
/// Minimum alignment in bytes for pattern-initialized sections.
pub const PATTERN_SECTION_ALIGNMENT: u32 = 4;

/// An instantiated section image.
///
/// Cloning duplicates the buffer. [`Section::take`] moves the buffer out and leaves an
/// empty shell behind.
#[derive(Debug, Clone)]
pub struct Section {
    name: String,
    header: SectionHeader,
    data: Option<Vec<u8>>,
}

impl Section {
    /// Build the in-memory image of the section described by `header`.
    ///
    /// `container` is the complete container; `header` offsets are relative to its start.
    ///
    /// # Errors
    /// - [`crate::Error::CorruptContainer`] if the section bytes run past the container or
    ///   the unpacked length exceeds the execution length
    /// - [`crate::Error::UnsupportedSectionType`] for kinds that are not instantiated
    /// - [`crate::Error::AlignmentViolation`] if the alignment is below the kind's minimum
    /// - pattern errors from [`crate::container::pattern::expand_into`]
    pub fn instantiate(header: &SectionHeader, name: &str, container: &[u8]) -> Result<Section> {
        let offset = header.container_offset as usize;
        let packed_size = header.container_length as usize;
        let unpacked_size = header.unpacked_length as usize;
        let execution_size = header.total_length as usize;

        check_range(offset, packed_size, container.len(), "packed data")?;

        if unpacked_size > execution_size {
            return Err(CorruptContainer(format!(
                "unpacked length {unpacked_size} exceeds execution length {execution_size}"
            )));
        }

        let kind = header.section_kind;
        let data = match kind {
            SectionKind::Code
            | SectionKind::UnpackedData
            | SectionKind::Constant
            | SectionKind::ExecutableData => {
                check_alignment(header, RAW_SECTION_ALIGNMENT)?;
                check_range(offset, execution_size, container.len(), "section data")?;

                container[offset..offset + execution_size].to_vec()
            }
            SectionKind::PatternInitializedData => {
                check_alignment(header, PATTERN_SECTION_ALIGNMENT)?;

                let mut data = vec![0u8; execution_size];
                pattern::expand_into(
                    &container[offset..offset + packed_size],
                    &mut data[..unpacked_size],
                )?;
                data
            }
            other => return Err(UnsupportedSectionType(other)),
        };

        debug!(
            "Instantiated {} section '{}': {} bytes from {} at 0x{:X}",
            kind,
            name,
            execution_size,
            packed_size,
            offset
        );

        Ok(Section {
            name: name.to_string(),
            header: header.clone(),
            data: Some(data),
        })
    }

    /// Wrap a section that is kept in its on-disk form, such as the loader section.
    ///
    /// The image holds the `container_length` bytes at the section's offset.
    ///
    /// # Errors
    /// Returns [`crate::Error::CorruptContainer`] if the bytes run past the container.
    pub fn raw(header: &SectionHeader, name: &str, container: &[u8]) -> Result<Section> {
        let offset = header.container_offset as usize;
        let packed_size = header.container_length as usize;
        check_range(offset, packed_size, container.len(), "packed data")?;

        Ok(Section {
            name: name.to_string(),
            header: header.clone(),
            data: Some(container[offset..offset + packed_size].to_vec()),
        })
    }

    /// Move the buffer into a new section, leaving `self` as an empty shell.
    ///
    /// The shell keeps its name and header, but [`Section::data`] returns `None`.
    #[must_use]
    pub fn take(&mut self) -> Section {
        Section {
            name: self.name.clone(),
            header: self.header.clone(),
            data: self.data.take(),
        }
    }

    /// The section name, empty for unnamed sections.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The header this section was built from.
    #[must_use]
    pub fn header(&self) -> &SectionHeader {
        &self.header
    }

    /// Section kind.
    #[must_use]
    pub fn kind(&self) -> SectionKind {
        self.header.section_kind
    }

    /// Share kind.
    #[must_use]
    pub fn share_kind(&self) -> ShareKind {
        self.header.share_kind
    }

    /// The section image, or `None` after [`Section::take`].
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Mutable access to the section image, for relocation by the binding step.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.data.as_deref_mut()
    }

    /// Length of the image in bytes, 0 for an empty shell.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, Vec::len)
    }

    /// True for an empty shell or a zero-length section.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_range(offset: usize, length: usize, container_len: usize, what: &str) -> Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= container_len => Ok(()),
        _ => Err(CorruptContainer(format!(
            "{what} at 0x{offset:X} (+{length}) runs past the {container_len}-byte container"
        ))),
    }
}

// The header stores log2 of the alignment, so exponent 3 is 8 bytes and too small for raw kinds.
fn check_alignment(header: &SectionHeader, required: u32) -> Result<()> {
    match header.alignment_bytes() {
        Some(bytes) if bytes % required == 0 => Ok(()),
        _ => Err(AlignmentViolation {
            exponent: header.alignment,
            required,
        }),
    }
}
