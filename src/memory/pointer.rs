//! Guest addresses and typed views of guest memory.

use std::{fmt, marker::PhantomData};

use crate::{file::io::PefIO, memory::AddressSpace, Result};

/// A 32-bit address in the guest's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GuestAddress(pub u32);

impl GuestAddress {
    /// The null guest pointer.
    pub const NULL: GuestAddress = GuestAddress(0);

    /// Create an address from its raw value.
    #[must_use]
    pub fn new(address: u32) -> Self {
        GuestAddress(address)
    }

    /// Raw address value, as stored in a guest register.
    #[must_use]
    pub fn value(self) -> u32 {
        self.0
    }

    /// True for the null pointer.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The address `offset` bytes further, or `None` on wrap-around.
    #[must_use]
    pub fn offset(self, offset: usize) -> Option<GuestAddress> {
        let offset = u32::try_from(offset).ok()?;
        self.0.checked_add(offset).map(GuestAddress)
    }
}

impl fmt::Display for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl From<u32> for GuestAddress {
    fn from(value: u32) -> Self {
        GuestAddress(value)
    }
}

/// A typed, validated view of a guest memory location.
///
/// Obtained from [`AddressSpace::to_pointer`], which checks that the whole value lies inside
/// one live allocation. Accesses go through the address space and are re-validated, so a
/// pointer into a region that was freed afterwards fails with
/// [`crate::Error::InvalidAddress`] instead of touching stale memory.
pub struct HostPtr<T> {
    address: GuestAddress,
    _marker: PhantomData<fn() -> T>,
}

impl<T> HostPtr<T> {
    pub(crate) fn new(address: GuestAddress) -> Self {
        HostPtr {
            address,
            _marker: PhantomData,
        }
    }

    /// The guest address this pointer was created from.
    #[must_use]
    pub fn address(&self) -> GuestAddress {
        self.address
    }
}

impl<T: PefIO> HostPtr<T> {
    /// Read the big-endian value behind this pointer.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidAddress`] if the allocation is gone.
    pub fn read(&self, space: &AddressSpace) -> Result<T> {
        space.load(self.address)
    }

    /// Store `value` big-endian behind this pointer.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidAddress`] if the allocation is gone.
    pub fn write(&self, space: &AddressSpace, value: T) -> Result<()> {
        space.store(self.address, value)
    }
}

impl<T> Clone for HostPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for HostPtr<T> {}

impl<T> PartialEq for HostPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl<T> Eq for HostPtr<T> {}

impl<T> fmt::Debug for HostPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostPtr<{}>({})", std::any::type_name::<T>(), self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_arithmetic() {
        let address = GuestAddress::new(0x1000_0000);
        assert_eq!(address.offset(0x10), Some(GuestAddress(0x1000_0010)));
        assert_eq!(GuestAddress(u32::MAX).offset(1), None);
        assert!(GuestAddress::NULL.is_null());
        assert_eq!(address.to_string(), "0x10000000");
    }
}
