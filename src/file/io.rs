//! Low-level byte order and safe reading/writing utilities for PEF and guest-memory access.
//!
//! Everything the PowerPC side of the house touches is big-endian: container headers,
//! loader-section tables, and every scalar stored in guest memory. This module provides
//! bounds-checked readers and writers over byte slices for the primitive types used by
//! those structures.
//!
//! # Key Components
//!
//! - [`crate::file::io::PefIO`] - Trait defining endian-aware conversions for primitive types
//! - [`crate::file::io::read_be`] / [`crate::file::io::read_be_at`] - Big-endian reads
//! - [`crate::file::io::write_be`] / [`crate::file::io::write_be_at`] - Big-endian writes
//!
//! # Examples
//!
//! ```rust,ignore
//! use pefrun::file::io::read_be_at;
//!
//! let data = [0x4A, 0x6F, 0x79, 0x21, 0x00, 0x01];
//! let mut offset = 0;
//!
//! let tag: u32 = read_be_at(&data, &mut offset)?;   // offset: 0 -> 4
//! let count: u16 = read_be_at(&data, &mut offset)?; // offset: 4 -> 6
//! assert_eq!(tag, 0x4A6F_7921);
//! assert_eq!(count, 1);
//! # Ok::<(), pefrun::Error>(())
//! ```
//!
//! # Error Handling
//!
//! All functions return [`crate::Error::OutOfBounds`] if there are insufficient bytes in the
//! buffer to complete the operation.

use crate::{Error::OutOfBounds, Result};

/// Trait for implementing type-specific safe binary data reading and writing operations.
///
/// Each implementation defines a `Bytes` associated type that represents the fixed-size
/// byte array required for that particular type (e.g., `[u8; 4]` for `u32`).
pub trait PefIO: Sized + Copy {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in big-endian
    fn from_be_bytes(bytes: Self::Bytes) -> Self;
    /// Read T from a byte buffer in host byte order
    fn from_ne_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in big-endian
    fn to_be_bytes(self) -> Self::Bytes;
    /// Write T to a byte buffer in host byte order
    fn to_ne_bytes(self) -> Self::Bytes;
}

macro_rules! impl_pef_io {
    ($($ty:ty),*) => {
        $(
            impl PefIO for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

                fn from_be_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_be_bytes(bytes)
                }

                fn from_ne_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_ne_bytes(bytes)
                }

                fn to_be_bytes(self) -> Self::Bytes {
                    <$ty>::to_be_bytes(self)
                }

                fn to_ne_bytes(self) -> Self::Bytes {
                    <$ty>::to_ne_bytes(self)
                }
            }
        )*
    };
}

impl_pef_io!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Safely reads a value of type `T` in big-endian byte order from the start of a buffer.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_be<T: PefIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_be_at(data, &mut offset)
}

/// Safely reads a value of type `T` in big-endian byte order at a specific offset.
///
/// The offset is advanced by the number of bytes read.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_be_at<T: PefIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;

    Ok(T::from_be_bytes(read))
}

/// Safely writes a value of type `T` in big-endian byte order to the start of a buffer.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too small.
pub fn write_be<T: PefIO>(data: &mut [u8], value: T) -> Result<()> {
    let mut offset = 0_usize;
    write_be_at(data, &mut offset, value)
}

/// Safely writes a value of type `T` in big-endian byte order at a specific offset.
///
/// The offset is advanced by the number of bytes written.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too small.
pub fn write_be_at<T: PefIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[*offset..end].copy_from_slice(value.to_be_bytes().as_ref());
    *offset = end;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BUFFER: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    #[test]
    fn read_be_u8() {
        let result = read_be::<u8>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x1);
    }

    #[test]
    fn read_be_u16() {
        let result = read_be::<u16>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x102);
    }

    #[test]
    fn read_be_i32() {
        let result = read_be::<i32>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x1020304);
    }

    #[test]
    fn read_be_u64() {
        let result = read_be::<u64>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x102030405060708);
    }

    #[test]
    fn read_be_f64() {
        let result = read_be::<f64>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 8.20788039913184e-304);
    }

    #[test]
    fn read_be_from() {
        let mut offset = 2_usize;
        let result = read_be_at::<u16>(&TEST_BUFFER, &mut offset).unwrap();
        assert_eq!(result, 0x304);
        assert_eq!(offset, 4);
    }

    #[test]
    fn read_be_past_end() {
        let mut offset = 6_usize;
        assert!(matches!(
            read_be_at::<u32>(&TEST_BUFFER, &mut offset),
            Err(OutOfBounds)
        ));
        assert_eq!(offset, 6);

        let mut offset = usize::MAX;
        assert!(read_be_at::<u8>(&TEST_BUFFER, &mut offset).is_err());
    }

    #[test]
    fn write_be_sequence() {
        let mut data = [0u8; 6];
        let mut offset = 0;
        write_be_at(&mut data, &mut offset, 0x4A6Fu16).unwrap();
        write_be_at(&mut data, &mut offset, 0x7921_0001u32).unwrap();
        assert_eq!(offset, 6);
        assert_eq!(data, [0x4A, 0x6F, 0x79, 0x21, 0x00, 0x01]);

        assert!(write_be(&mut data[..3], 1u32).is_err());
    }
}
