use core::{num::NonZeroUsize, ptr::NonNull};

use crate::{polyfill::NonNullStrict, BuddyError};

/// The region of memory managed by an allocator.
///
/// Translates between pointers into the region and zero-based page indices.
/// Pointers handed out by the region carry the provenance of its base pointer.
#[derive(Copy, Clone, Debug)]
pub struct Region<const PAGE_SIZE: usize> {
    ptr: NonNull<u8>,
    num_pages: usize,
}

impl<const PAGE_SIZE: usize> Region<PAGE_SIZE> {
    /// Creates a `Region` of `num_pages` pages starting at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegion` if the region would extend past the end of the
    /// address space.
    pub fn new(ptr: NonNull<u8>, num_pages: usize) -> Result<Region<PAGE_SIZE>, BuddyError> {
        num_pages
            .checked_mul(PAGE_SIZE)
            .and_then(|extent| ptr.addr().get().checked_add(extent))
            .ok_or(BuddyError::InvalidRegion)?;

        Ok(Region { ptr, num_pages })
    }

    /// Returns the base pointer.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    #[inline]
    pub fn num_pages(self) -> usize {
        self.num_pages
    }

    /// Returns the address one past the last byte of the region.
    #[inline]
    pub fn limit(self) -> usize {
        // Cannot overflow; checked in `new`.
        self.addr().get() + self.num_pages * PAGE_SIZE
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.addr() <= addr && addr.get() < self.limit()
    }

    /// Returns the index of the page starting at `ptr`.
    ///
    /// Returns `None` if `ptr` precedes the base, is not page-aligned relative
    /// to the base, or lies past the end of the region.
    pub fn index_of(self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = ptr.addr();
        if !self.contains_addr(addr) {
            return None;
        }

        let offset = addr.get() - self.addr().get();
        (offset % PAGE_SIZE == 0).then_some(offset / PAGE_SIZE)
    }

    /// Returns a pointer to the page at `index`.
    ///
    /// The caller must ensure that `index` is less than the page count.
    pub fn address_of(self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.num_pages, "page index out of region");

        // Cannot overflow; checked in `new`.
        let addr = self.addr().get() + index * PAGE_SIZE;

        // SAFETY: `addr` is at least the address of the base pointer, which is
        // non-zero.
        self.ptr.with_addr(unsafe { NonZeroUsize::new_unchecked(addr) })
    }
}

#[cfg(test)]
mod tests {
    use sptr::invalid_mut;

    use super::*;

    const BASE: usize = 0x10_0000;

    fn region(num_pages: usize) -> Region<4096> {
        let ptr = NonNull::new(invalid_mut::<u8>(BASE)).unwrap();
        Region::new(ptr, num_pages).unwrap()
    }

    fn ptr_at(addr: usize) -> NonNull<u8> {
        NonNull::new(invalid_mut::<u8>(addr)).unwrap()
    }

    #[test]
    fn index_round_trips_through_address() {
        let r = region(8);

        for index in 0..8 {
            assert_eq!(r.index_of(r.address_of(index)), Some(index));
        }

        assert_eq!(r.address_of(3).addr().get(), BASE + 3 * 4096);
    }

    #[test]
    fn index_of_rejects_out_of_region() {
        let r = region(8);

        assert_eq!(r.index_of(ptr_at(BASE - 4096)), None);
        assert_eq!(r.index_of(ptr_at(BASE - 1)), None);
        assert_eq!(r.index_of(ptr_at(BASE + 8 * 4096)), None);
        assert_eq!(r.index_of(ptr_at(r.limit())), None);
    }

    #[test]
    fn index_of_rejects_misaligned() {
        let r = region(8);

        assert_eq!(r.index_of(ptr_at(BASE + 1)), None);
        assert_eq!(r.index_of(ptr_at(BASE + 4096 + 2048)), None);
    }

    #[test]
    fn contains_addr_matches_extent() {
        let r = region(2);

        assert!(r.contains_addr(r.addr()));
        assert!(r.contains_addr(NonZeroUsize::new(r.limit() - 1).unwrap()));
        assert!(!r.contains_addr(NonZeroUsize::new(r.limit()).unwrap()));
    }

    #[test]
    fn new_rejects_overflowing_region() {
        let ptr = ptr_at(usize::MAX - 4095);

        assert!(Region::<4096>::new(ptr, 1).is_err());
        assert!(Region::<4096>::new(ptr_at(BASE), usize::MAX / 2).is_err());
        assert!(Region::<4096>::new(ptr, 0).is_ok());
    }
}
