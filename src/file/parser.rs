//! Cursor-style reader over borrowed container bytes.
//!
//! [`Parser`] is used for every sequential decode in the crate: container and section
//! headers, loader-section tables and pattern-initialization bytecode.
//!
//! # Examples
//!
//! ```rust
//! use pefrun::Parser;
//!
//! let data = [0x00, 0x00, 0x00, 0x2A, 0x81, 0x00];
//! let mut parser = Parser::new(&data);
//! assert_eq!(parser.read_be::<u32>()?, 42);
//! assert_eq!(parser.read_varint()?, 0x80);
//! assert!(!parser.has_more_data());
//! # Ok::<(), pefrun::Error>(())
//! ```

use crate::{
    file::io::{read_be_at, PefIO},
    Result,
};

/// Maximum number of bytes in a pattern varint; 5 groups of 7 bits cover a `u32`.
pub const MAX_VARINT_LEN: usize = 5;

/// A bounds-checked cursor over a byte slice.
pub struct Parser<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new parser positioned at the first byte of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Total length of the underlying data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the underlying data is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true while unread bytes remain.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Move the cursor to an absolute position.
    ///
    /// Seeking to exactly the end is allowed; the next read will fail.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `pos` is past the end of the data.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position = pos;
        Ok(())
    }

    /// Skip `step` bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if that would move past the end.
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        let end = self.calc_end_position(step)?;
        self.position = end;
        Ok(())
    }

    /// Current cursor position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// The full underlying data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data
    }

    /// Read a big-endian value and advance.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if not enough bytes remain.
    pub fn read_be<T: PefIO>(&mut self) -> Result<T> {
        read_be_at::<T>(self.data, &mut self.position)
    }

    /// Read a pattern-bytecode varint.
    ///
    /// Values are stored big-endian in groups of 7 bits; every byte but the last has its top
    /// bit set. At most [`MAX_VARINT_LEN`] bytes are accepted and the value must fit a `u32`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncated input and [`crate::Error::Malformed`]
    /// for overlong or overflowing encodings.
    pub fn read_varint(&mut self) -> Result<u32> {
        let start = self.position;
        let mut value = 0u32;

        loop {
            let byte = self.read_be::<u8>()?;
            if self.position - start > MAX_VARINT_LEN {
                return Err(malformed_error!(
                    "Varint at offset {} is longer than {} bytes",
                    start,
                    MAX_VARINT_LEN
                ));
            }

            // The fifth group may only contribute the 4 low bits that are still free.
            if value > (u32::MAX >> 7) {
                return Err(malformed_error!(
                    "Varint at offset {} overflows 32 bits",
                    start
                ));
            }
            value = (value << 7) | u32::from(byte & 0x7F);

            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
    }

    /// Read a NUL-terminated string, advancing past the terminator.
    ///
    /// Classic Mac OS names are MacRoman; bytes outside ASCII are replaced lossily. A string
    /// that runs to the end of the data without a terminator is accepted.
    pub fn read_cstring(&mut self) -> String {
        let start = self.position;
        let mut end = start;

        while end < self.data.len() && self.data[end] != 0 {
            end += 1;
        }

        let string_data = &self.data[start..end];
        self.position = if end < self.data.len() { end + 1 } else { end };

        String::from_utf8_lossy(string_data).into_owned()
    }

    /// Bytes left to read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Compute the position `length` bytes ahead, checking bounds and overflow.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the end would fall past the data.
    pub fn calc_end_position(&self, length: usize) -> Result<usize> {
        let end = self
            .position
            .checked_add(length)
            .ok_or(out_of_bounds_error!())?;

        if end > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        Ok(end)
    }

    /// Borrow the next `length` bytes and advance.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if not enough bytes remain.
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self.calc_end_position(length)?;
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }
}
