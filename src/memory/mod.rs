//! Guest memory and address translation.
//!
//! Guest code sees a flat 32-bit big-endian address space. [`AddressSpace`] owns every
//! allocation made on the guest's behalf (library globals, strings, buffers) and translates
//! guest addresses into bounds-checked host accesses. [`Allocator`] is the seam the built-in
//! libraries allocate through.
//!
//! # Examples
//!
//! ```rust
//! use pefrun::memory::{AddressSpace, AddressSpaceConfig, Allocator};
//!
//! let space = AddressSpace::new(AddressSpaceConfig::new().limit(4096));
//! let block = space.allocate(8, "example")?;
//!
//! let pointer = space.to_pointer::<u32>(block)?;
//! pointer.write(&space, 42)?;
//! assert_eq!(space.read_bytes(block, 4)?, vec![0, 0, 0, 42]);
//! assert_eq!(space.to_int_ptr(&pointer), block);
//! # Ok::<(), pefrun::Error>(())
//! ```

mod pointer;
mod space;

pub use pointer::{GuestAddress, HostPtr};
pub use space::{AddressSpace, AddressSpaceConfig};

use crate::Result;

/// Allocation interface used by libraries for their guest-visible state.
pub trait Allocator: Send + Sync {
    /// Allocate `size` zeroed bytes, 16-byte aligned. `label` names the allocation in
    /// diagnostics.
    ///
    /// # Errors
    /// Returns [`crate::Error::AllocationFailure`] when the request cannot be satisfied.
    fn allocate(&self, size: usize, label: &str) -> Result<GuestAddress>;

    /// Free an allocation by its start address.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidAddress`] if `address` is not a live allocation start.
    fn deallocate(&self, address: GuestAddress) -> Result<()>;

    /// Bytes that can still be allocated.
    fn available(&self) -> usize;
}
