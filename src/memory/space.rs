//! The shared guest address space.
//!
//! Allocations are bump-allocated upwards from a configurable base address, 16-byte aligned
//! and never overlap. Freed address ranges are not reused, so a stale guest pointer can never
//! alias a newer allocation.

use std::{collections::BTreeMap, sync::Mutex};

use log::trace;

use crate::{
    file::io::{read_be, write_be, PefIO},
    memory::{Allocator, GuestAddress, HostPtr},
    Error::{AllocationFailure, InvalidAddress},
    Result,
};

const ALLOCATION_ALIGNMENT: u32 = 16;

/// Configuration for an [`AddressSpace`].
#[derive(Debug, Clone)]
pub struct AddressSpaceConfig {
    /// First guest address handed out, rounded up to 16 bytes
    pub base: u32,
    /// Maximum number of live bytes
    pub limit: usize,
}

impl Default for AddressSpaceConfig {
    fn default() -> Self {
        Self {
            base: 0x1000_0000,
            limit: 64 * 1024 * 1024,
        }
    }
}

impl AddressSpaceConfig {
    /// Creates a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the first guest address.
    #[must_use]
    pub fn base(mut self, base: u32) -> Self {
        self.base = base;
        self
    }

    /// Set the maximum number of live bytes.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Debug)]
struct Region {
    data: Box<[u8]>,
    label: String,
}

#[derive(Debug)]
struct Arena {
    regions: BTreeMap<u32, Region>,
    next: u32,
    used: usize,
    limit: usize,
}

impl Arena {
    /// Region containing `[address, address + len)`, with the offset of `address` in it.
    fn locate(&self, address: u32, len: usize) -> Result<(u32, usize)> {
        let Some((&base, region)) = self.regions.range(..=address).next_back() else {
            return Err(InvalidAddress(address));
        };

        let offset = (address - base) as usize;
        match offset.checked_add(len) {
            Some(end) if end <= region.data.len() && (offset < region.data.len() || len == 0) => {
                Ok((base, offset))
            }
            _ => Err(InvalidAddress(address)),
        }
    }

    fn slice(&self, address: u32, len: usize) -> Result<&[u8]> {
        let (base, offset) = self.locate(address, len)?;
        let region = self.regions.get(&base).ok_or(InvalidAddress(address))?;
        Ok(&region.data[offset..offset + len])
    }

    fn slice_mut(&mut self, address: u32, len: usize) -> Result<&mut [u8]> {
        let (base, offset) = self.locate(address, len)?;
        let region = self.regions.get_mut(&base).ok_or(InvalidAddress(address))?;
        Ok(&mut region.data[offset..offset + len])
    }
}

/// Guest memory shared by the loader, the built-in libraries and the execution engine.
///
/// Usually held in an `Arc`; every method takes `&self` and serializes on an internal lock.
#[derive(Debug)]
pub struct AddressSpace {
    arena: Mutex<Arena>,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new(AddressSpaceConfig::default())
    }
}

impl AddressSpace {
    /// Create an empty address space.
    #[must_use]
    pub fn new(config: AddressSpaceConfig) -> Self {
        let base = config
            .base
            .checked_next_multiple_of(ALLOCATION_ALIGNMENT)
            .unwrap_or(u32::MAX - (ALLOCATION_ALIGNMENT - 1));

        AddressSpace {
            arena: Mutex::new(Arena {
                regions: BTreeMap::new(),
                next: base.max(ALLOCATION_ALIGNMENT),
                used: 0,
                limit: config.limit,
            }),
        }
    }

    /// Bytes currently allocated.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the lock is poisoned.
    pub fn used(&self) -> Result<usize> {
        Ok(lock!(self.arena)?.used)
    }

    /// Number of live allocations.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the lock is poisoned.
    pub fn allocation_count(&self) -> Result<usize> {
        Ok(lock!(self.arena)?.regions.len())
    }

    /// The label an allocation was created with, if `address` is an allocation start.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the lock is poisoned.
    pub fn label(&self, address: GuestAddress) -> Result<Option<String>> {
        let arena = lock!(self.arena)?;
        Ok(arena
            .regions
            .get(&address.value())
            .map(|region| region.label.clone()))
    }

    /// True if `[address, address + len)` lies inside one live allocation.
    #[must_use]
    pub fn contains(&self, address: GuestAddress, len: usize) -> bool {
        lock!(self.arena).is_ok_and(|arena| arena.locate(address.value(), len).is_ok())
    }

    /// Validate a typed guest pointer.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidAddress`] unless `size_of::<T>()` bytes at `address`
    /// lie inside one live allocation.
    pub fn to_pointer<T>(&self, address: GuestAddress) -> Result<HostPtr<T>> {
        let arena = lock!(self.arena)?;
        arena.locate(address.value(), std::mem::size_of::<T>())?;
        Ok(HostPtr::new(address))
    }

    /// The guest address behind a typed pointer.
    #[must_use]
    pub fn to_int_ptr<T>(&self, pointer: &HostPtr<T>) -> GuestAddress {
        pointer.address()
    }

    /// Copy `len` bytes out of guest memory.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidAddress`] if the range is not inside one allocation.
    pub fn read_bytes(&self, address: GuestAddress, len: usize) -> Result<Vec<u8>> {
        let arena = lock!(self.arena)?;
        Ok(arena.slice(address.value(), len)?.to_vec())
    }

    /// Copy `data` into guest memory.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidAddress`] if the range is not inside one allocation.
    pub fn write_bytes(&self, address: GuestAddress, data: &[u8]) -> Result<()> {
        let mut arena = lock!(self.arena)?;
        arena
            .slice_mut(address.value(), data.len())?
            .copy_from_slice(data);
        Ok(())
    }

    /// Set `len` bytes of guest memory to `value`.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidAddress`] if the range is not inside one allocation.
    pub fn fill(&self, address: GuestAddress, value: u8, len: usize) -> Result<()> {
        let mut arena = lock!(self.arena)?;
        arena.slice_mut(address.value(), len)?.fill(value);
        Ok(())
    }

    /// Copy `len` bytes between two guest ranges, which may overlap or lie in different
    /// allocations.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidAddress`] if either range is invalid.
    pub fn copy(&self, destination: GuestAddress, source: GuestAddress, len: usize) -> Result<()> {
        let mut arena = lock!(self.arena)?;
        let data = arena.slice(source.value(), len)?.to_vec();
        arena
            .slice_mut(destination.value(), len)?
            .copy_from_slice(&data);
        Ok(())
    }

    /// Load a big-endian value.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidAddress`] if the value is not inside one allocation.
    pub fn load<T: PefIO>(&self, address: GuestAddress) -> Result<T> {
        let arena = lock!(self.arena)?;
        read_be(arena.slice(address.value(), std::mem::size_of::<T>())?)
    }

    /// Store a big-endian value.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidAddress`] if the value is not inside one allocation.
    pub fn store<T: PefIO>(&self, address: GuestAddress, value: T) -> Result<()> {
        let mut arena = lock!(self.arena)?;
        write_be(
            arena.slice_mut(address.value(), std::mem::size_of::<T>())?,
            value,
        )
    }

    /// Read a NUL-terminated byte string, without the terminator.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidAddress`] if `address` is unmapped or the string runs to
    /// the end of its allocation without a terminator.
    pub fn read_cstring(&self, address: GuestAddress) -> Result<Vec<u8>> {
        let arena = lock!(self.arena)?;
        let (base, offset) = arena.locate(address.value(), 1)?;
        let region = arena
            .regions
            .get(&base)
            .ok_or(InvalidAddress(address.value()))?;

        let tail = &region.data[offset..];
        match tail.iter().position(|byte| *byte == 0) {
            Some(end) => Ok(tail[..end].to_vec()),
            None => Err(InvalidAddress(address.value())),
        }
    }

    /// Read a NUL-terminated string, replacing bytes outside ASCII lossily.
    ///
    /// # Errors
    /// Same as [`AddressSpace::read_cstring`].
    pub fn read_string(&self, address: GuestAddress) -> Result<String> {
        let bytes = self.read_cstring(address)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write `value` followed by a NUL terminator.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidAddress`] if the string does not fit the allocation.
    pub fn write_cstring(&self, address: GuestAddress, value: &[u8]) -> Result<()> {
        let mut arena = lock!(self.arena)?;
        let target = arena.slice_mut(address.value(), value.len() + 1)?;
        target[..value.len()].copy_from_slice(value);
        target[value.len()] = 0;
        Ok(())
    }

    /// Allocate a NUL-terminated copy of `value`.
    ///
    /// # Errors
    /// Returns [`crate::Error::AllocationFailure`] if the space is exhausted.
    pub fn allocate_cstring(&self, value: &str) -> Result<GuestAddress> {
        let address = Allocator::allocate(self, value.len() + 1, "string")?;
        self.write_cstring(address, value.as_bytes())?;
        Ok(address)
    }
}

impl Allocator for AddressSpace {
    fn allocate(&self, size: usize, label: &str) -> Result<GuestAddress> {
        let mut arena = lock!(self.arena)?;
        let available = arena.limit.saturating_sub(arena.used);
        if size > available {
            return Err(AllocationFailure {
                requested: size,
                available,
            });
        }

        let step = u32::try_from(size.max(1))
            .ok()
            .and_then(|size| size.checked_next_multiple_of(ALLOCATION_ALIGNMENT));
        let Some(end) = step.and_then(|step| arena.next.checked_add(step)) else {
            return Err(AllocationFailure {
                requested: size,
                available: (u32::MAX - arena.next) as usize,
            });
        };

        let address = arena.next;
        arena.next = end;
        arena.used += size;
        arena.regions.insert(
            address,
            Region {
                data: vec![0u8; size].into_boxed_slice(),
                label: label.to_string(),
            },
        );

        trace!("Allocated {size} bytes for '{label}' at 0x{address:08X}");
        Ok(GuestAddress(address))
    }

    fn deallocate(&self, address: GuestAddress) -> Result<()> {
        let mut arena = lock!(self.arena)?;
        let Some(region) = arena.regions.remove(&address.value()) else {
            return Err(InvalidAddress(address.value()));
        };

        arena.used = arena.used.saturating_sub(region.data.len());
        trace!("Freed '{}' at {}", region.label, address);
        Ok(())
    }

    fn available(&self) -> usize {
        lock!(self.arena).map_or(0, |arena| arena.limit.saturating_sub(arena.used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn space() -> AddressSpace {
        AddressSpace::new(AddressSpaceConfig::new().base(0x2000_0001).limit(256))
    }

    #[test]
    fn aligned_and_disjoint() {
        let space = space();
        let first = space.allocate(3, "first").unwrap();
        let second = space.allocate(17, "second").unwrap();
        let third = space.allocate(0, "empty").unwrap();

        assert_eq!(first, GuestAddress(0x2000_0010));
        assert_eq!(second, GuestAddress(0x2000_0020));
        assert_eq!(third, GuestAddress(0x2000_0040));
        assert_eq!(space.used().unwrap(), 20);
        assert_eq!(space.label(second).unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn limit() {
        let space = space();
        space.allocate(200, "big").unwrap();
        match space.allocate(100, "too big") {
            Err(Error::AllocationFailure {
                requested,
                available,
            }) => {
                assert_eq!(requested, 100);
                assert_eq!(available, 56);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(space.available(), 56);
    }

    #[test]
    fn free() {
        let space = space();
        let block = space.allocate(16, "block").unwrap();
        space.deallocate(block).unwrap();
        assert_eq!(space.used().unwrap(), 0);
        assert!(matches!(
            space.deallocate(block),
            Err(Error::InvalidAddress(_))
        ));
        assert!(!space.contains(block, 1));

        // Freed ranges are not handed out again
        let next = space.allocate(16, "next").unwrap();
        assert_ne!(next, block);
    }

    #[test]
    fn big_endian_access() {
        let space = space();
        let block = space.allocate(8, "values").unwrap();

        space.store(block, 0x1234_5678u32).unwrap();
        assert_eq!(space.read_bytes(block, 4).unwrap(), vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(space.load::<u16>(block.offset(2).unwrap()).unwrap(), 0x5678);

        // Straddling the end of the allocation
        assert!(matches!(
            space.load::<u64>(block.offset(4).unwrap()),
            Err(Error::InvalidAddress(_))
        ));
        assert!(space.store(GuestAddress(0x100), 1u8).is_err());
    }

    #[test]
    fn pointers() {
        let space = space();
        let block = space.allocate(8, "values").unwrap();

        let pointer = space.to_pointer::<u32>(block.offset(4).unwrap()).unwrap();
        pointer.write(&space, 0xCAFE_BABE).unwrap();
        assert_eq!(pointer.read(&space).unwrap(), 0xCAFE_BABE);
        assert_eq!(space.to_int_ptr(&pointer), block.offset(4).unwrap());

        assert!(space.to_pointer::<u32>(block.offset(5).unwrap()).is_err());
        assert!(space.to_pointer::<u8>(GuestAddress(0)).is_err());

        space.deallocate(block).unwrap();
        assert!(matches!(
            pointer.read(&space),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn strings_and_copies() {
        let space = space();
        let block = space.allocate(32, "strings").unwrap();
        space.write_cstring(block, b"hello").unwrap();
        assert_eq!(space.read_string(block).unwrap(), "hello");

        let other = space.allocate(16, "other").unwrap();
        space.copy(other, block, 6).unwrap();
        assert_eq!(space.read_cstring(other).unwrap(), b"hello");

        space.fill(other, b'x', 16).unwrap();
        assert!(space.read_cstring(other).is_err());
        assert!(space.write_cstring(other, &[b'a'; 16]).is_err());
    }

    #[test]
    fn concurrent_allocations_stay_disjoint() {
        let space = std::sync::Arc::new(AddressSpace::new(
            AddressSpaceConfig::new().base(0x3000_0000).limit(1 << 20),
        ));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let space = space.clone();
                std::thread::spawn(move || {
                    let mut kept = Vec::new();
                    for index in 0..200 {
                        let block = space.allocate(24, "worker").unwrap();
                        if index % 2 == 0 {
                            space.deallocate(block).unwrap();
                        } else {
                            kept.push(block.value());
                        }
                    }
                    kept
                })
            })
            .collect();

        let mut blocks: Vec<u32> = workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect();
        blocks.sort_unstable();

        assert_eq!(blocks.len(), 800);
        assert!(blocks.windows(2).all(|pair| pair[1] - pair[0] >= 24));
        assert_eq!(space.used().unwrap(), 800 * 24);
        assert_eq!(space.allocation_count().unwrap(), 800);

        for block in blocks {
            space.deallocate(GuestAddress(block)).unwrap();
        }
        assert_eq!(space.used().unwrap(), 0);
    }
}
