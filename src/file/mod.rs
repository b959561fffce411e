//! Container byte sources.
//!
//! A [`File`] owns the raw bytes of a PEF container, either read into memory or
//! memory-mapped from disk. Parsing never copies the container; section instantiation
//! reads from the borrowed slice returned by [`File::data`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use pefrun::File;
//! use std::path::Path;
//!
//! let file = File::from_file(Path::new("SimpleText"))?;
//! let header = file.data_slice(0, 40)?;
//! assert_eq!(&header[..4], b"Joy!");
//! # Ok::<(), pefrun::Error>(())
//! ```

pub mod io;
pub mod parser;

mod memory;
mod physical;

use std::path::Path;

use crate::{Error::NotSupported, Result};
use memory::Memory;
use physical::Physical;

/// Backend trait for file data sources.
///
/// This trait abstracts over the source of container data, allowing for both in-memory and
/// on-disk representations. All implementations must be thread-safe.
pub trait Backend: Send + Sync {
    /// Returns a slice of the data at the given offset and length.
    ///
    /// # Errors
    ///
    /// Returns an error if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize;
}

/// Raw bytes of a loaded container.
pub struct File {
    data: Box<dyn Backend>,
}

impl File {
    /// Memory-maps a container from the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped, or if it is empty.
    pub fn from_file(file: &Path) -> Result<File> {
        let input = Physical::new(file)?;
        Self::from_backend(Box::new(input))
    }

    /// Wraps an in-memory buffer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotSupported`] if the buffer is empty.
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        Self::from_backend(Box::new(Memory::new(data)))
    }

    fn from_backend(data: Box<dyn Backend>) -> Result<File> {
        if data.len() == 0 {
            return Err(NotSupported);
        }

        Ok(File { data })
    }

    /// Size of the container in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the container holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// The whole container.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// A bounds-checked range of the container.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the range does not fit.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data.data_slice(offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_mem() {
        let file = File::from_mem(vec![0x4A, 0x6F, 0x79, 0x21]).unwrap();
        assert_eq!(file.len(), 4);
        assert!(!file.is_empty());
        assert_eq!(file.data_slice(1, 2).unwrap(), &[0x6F, 0x79]);
        assert!(file.data_slice(3, 2).is_err());
    }

    #[test]
    fn from_mem_empty() {
        assert!(matches!(File::from_mem(Vec::new()), Err(NotSupported)));
    }
}
