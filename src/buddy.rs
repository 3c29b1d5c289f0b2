//! Buddy page allocation.
//!
//! A buddy allocator manages a region of pages as a set of power-of-two sized
//! blocks. A block of rank `r` spans `2^(r - 1)` pages and starts at a page
//! index that is a multiple of its size. Two blocks of rank `r` whose indices
//! differ only in bit `r - 1` are _buddies_; together they form the block of
//! rank `r + 1` that contains them both.
//!
//! Allocation takes the smallest free block of at least the requested rank
//! and splits it in half until it reaches the requested rank, releasing the
//! upper half at each step. Freeing a block merges it with its buddy for as
//! long as the buddy is free and of equal rank.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Free-list operations | Metadata writes      |
//! |--------------------------|----------------------|----------------------|
//! | Allocate                 | at most `MAX_RANK`   | size of split block  |
//! | Free                     | at most `MAX_RANK`   | size of merged block |
//! | Rank query               | none                 | none                 |
//! | Free block count         | none                 | none                 |
//!
//! #### Fragmentation
//!
//! Free memory is always held as the coarsest possible set of aligned blocks,
//! so external fragmentation only arises from the placement of live
//! allocations. Internal fragmentation is bounded by the power-of-two block
//! sizes: callers request whole ranks.

use core::{cmp, fmt, ptr::NonNull};

use log::{debug, trace, warn};

use crate::{
    free_list::FreeRegistry, meta::PageMetaTable, region::Region, BuddyError, BuddyStats,
};

/// The default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// The default maximum rank. A rank-16 block spans 32768 pages.
pub const DEFAULT_MAX_RANK: usize = 16;

/// A `PageBuddy` with 4 KiB pages and ranks 1 through 16.
pub type DefaultPageBuddy = PageBuddy<DEFAULT_PAGE_SIZE, DEFAULT_MAX_RANK>;

/// A buddy page allocator over a fixed region.
///
/// This takes two const parameters:
/// - `PAGE_SIZE` is the size of a page in bytes.
/// - `MAX_RANK` is the largest rank. A block of rank `r` spans `2^(r - 1)`
///   pages, so the largest block spans `2^(MAX_RANK - 1)` pages.
///
/// These parameters are subject to the following invariants:
/// - `PAGE_SIZE` must be a power of two.
/// - `MAX_RANK` must be nonzero, less than `usize::BITS`, and no greater than
///   `u8::MAX`.
///
/// Attempting to construct a `PageBuddy` whose const parameters violate these
/// invariants will result in a panic.
///
/// The region may hold at most [`Self::capacity()`] pages, i.e. one block of
/// the maximum rank. Its page count need not be a power of two; it is tiled
/// with the largest aligned blocks that fit.
///
/// The allocator never reads or writes the managed memory, so every method is
/// safe to call with any pointer.
pub struct PageBuddy<
    const PAGE_SIZE: usize = { DEFAULT_PAGE_SIZE },
    const MAX_RANK: usize = { DEFAULT_MAX_RANK },
> {
    region: Region<PAGE_SIZE>,
    meta: PageMetaTable,
    free: FreeRegistry<MAX_RANK>,
    /// Number of pages in free blocks.
    free_pages: usize,
}

// SAFETY: The allocator holds the base pointer only to derive addresses from
// it. It never dereferences the pointer or any address in the region.
unsafe impl<const PAGE_SIZE: usize, const MAX_RANK: usize> Send for PageBuddy<PAGE_SIZE, MAX_RANK> {}

impl<const PAGE_SIZE: usize, const MAX_RANK: usize> PageBuddy<PAGE_SIZE, MAX_RANK> {
    fn assert_const_param_invariants() {
        assert!(
            PAGE_SIZE.is_power_of_two(),
            "buddy allocator page size must be a power of two"
        );
        assert!(MAX_RANK > 0, "buddy allocator must have at least one rank");
        assert!(
            MAX_RANK < usize::BITS as usize,
            "buddy allocator cannot have more ranks than bits in a usize"
        );
        assert!(
            MAX_RANK <= usize::from(u8::MAX),
            "buddy allocator ranks must fit in a u8"
        );
    }

    /// Returns the largest number of pages an allocator of this type can
    /// manage.
    pub fn capacity() -> usize {
        Self::assert_const_param_invariants();

        Self::pages(MAX_RANK)
    }

    /// Returns the number of pages in a block of `rank`.
    #[inline]
    fn pages(rank: usize) -> usize {
        1 << (rank - 1)
    }

    #[inline]
    fn check_rank(rank: usize) -> Result<(), BuddyError> {
        if !(1..=MAX_RANK).contains(&rank) {
            return Err(BuddyError::InvalidRank);
        }

        Ok(())
    }

    /// Constructs a new `PageBuddy` managing `num_pages` pages starting at
    /// `base`.
    ///
    /// The region is tiled from the start with the largest aligned blocks that
    /// fit, and every page begins free.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `num_pages` exceeds [`Self::capacity()`] (`CapacityExceeded`).
    /// - The region extends past the end of the address space
    ///   (`InvalidRegion`).
    ///
    /// # Panics
    ///
    /// Panics if the const parameters violate the invariants listed in the
    /// [type-level documentation](PageBuddy).
    pub fn init(base: NonNull<u8>, num_pages: usize) -> Result<Self, BuddyError> {
        let meta = PageMetaTable::new(num_pages, Self::capacity())?;
        let region = Region::new(base, num_pages)?;
        debug_assert_eq!(meta.len(), region.num_pages());

        let mut buddy = PageBuddy {
            region,
            meta,
            free: FreeRegistry::new(num_pages),
            free_pages: num_pages,
        };

        let mut index = 0;
        let mut num_blocks = 0;
        while index < num_pages {
            let rank = buddy.largest_fit(index);
            buddy.insert_free(index, rank);

            index += Self::pages(rank);
            num_blocks += 1;
        }

        buddy.free.reset_ops();

        debug!(
            "buddy: tiled {} pages at {:#x} into {} free blocks",
            num_pages,
            region.addr().get(),
            num_blocks
        );

        Ok(buddy)
    }

    /// Returns the rank of the largest block that can start at `index`.
    fn largest_fit(&self, index: usize) -> usize {
        let num_pages = self.region.num_pages();

        (1..=MAX_RANK)
            .rev()
            .find(|&rank| {
                let pages = Self::pages(rank);
                index % pages == 0 && index + pages <= num_pages
            })
            // A single page always fits.
            .unwrap_or(1)
    }

    /// Marks the block at `index` free with `rank` and adds it to the free
    /// list for `rank`.
    fn insert_free(&mut self, index: usize, rank: usize) {
        self.meta.mark(index, Self::pages(rank), rank, true);
        self.free.push_front(rank, index);
    }

    /// Allocates a block of `rank`, returning the index of its first page.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRank` if `rank` is outside `1..=MAX_RANK`, or
    /// `OutOfMemory` if no free block of at least `rank` exists.
    pub fn allocate_index(&mut self, rank: usize) -> Result<usize, BuddyError> {
        self.free.reset_ops();
        Self::check_rank(rank)?;

        // Scan ranks, not blocks: the first non-empty list holds the smallest
        // block that satisfies the request.
        let free = &mut self.free;
        let (mut cur_rank, block) = (rank..=MAX_RANK)
            .find_map(|r| free.pop_front(r).map(|block| (r, block)))
            .ok_or_else(|| {
                warn!("buddy: out of memory allocating rank {}", rank);
                BuddyError::OutOfMemory
            })?;

        // Split the block repeatedly to obtain a block of `rank`. The index of
        // the lower half does not change.
        while cur_rank > rank {
            cur_rank -= 1;

            let upper = block + Self::pages(cur_rank);
            trace!("buddy: split {} into rank {} halves", block, cur_rank);
            self.insert_free(upper, cur_rank);
        }

        let pages = Self::pages(rank);
        self.meta.mark(block, pages, rank, false);
        self.free_pages -= pages;

        Ok(block)
    }

    /// Allocates a block of `rank`.
    ///
    /// The returned pointer has the provenance of the base pointer passed to
    /// [`PageBuddy::init`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidRank` if `rank` is outside `1..=MAX_RANK`, or
    /// `OutOfMemory` if no free block of at least `rank` exists.
    pub fn allocate(&mut self, rank: usize) -> Result<NonNull<u8>, BuddyError> {
        let index = self.allocate_index(rank)?;

        Ok(self.region.address_of(index))
    }

    /// Frees the block whose first page is at `index`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPointer` if `index` is out of range or refers to the
    /// interior of an allocated block, and `DoubleFree` if the page is already
    /// free.
    pub fn free_index(&mut self, index: usize) -> Result<(), BuddyError> {
        self.free.reset_ops();

        if index >= self.region.num_pages() {
            warn!("buddy: free of out-of-range page {}", index);
            return Err(BuddyError::InvalidPointer);
        }

        let meta = self.meta.get(index);
        if meta.is_free || meta.rank() == 0 {
            warn!("buddy: double free of page {}", index);
            return Err(BuddyError::DoubleFree);
        }

        let mut rank = meta.rank();
        if index % Self::pages(rank) != 0 {
            warn!("buddy: free of page {} inside a rank {} block", index, rank);
            return Err(BuddyError::InvalidPointer);
        }

        self.free_pages += Self::pages(rank);

        let num_pages = self.region.num_pages();
        let mut block = index;

        while rank < MAX_RANK {
            let buddy = block ^ Self::pages(rank);
            if buddy >= num_pages {
                break;
            }

            // A buddy that is split or allocated has a different rank or is
            // not free.
            let buddy_meta = self.meta.get(buddy);
            if !buddy_meta.is_free || buddy_meta.rank() != rank {
                break;
            }

            trace!("buddy: merge {} with {} at rank {}", block, buddy, rank);
            self.free.remove(rank, buddy);

            block = cmp::min(block, buddy);
            rank += 1;
        }

        self.insert_free(block, rank);

        Ok(())
    }

    /// Frees the block starting at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPointer` if `ptr` is not the start of an allocated
    /// block in the region, and `DoubleFree` if the block is already free.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), BuddyError> {
        self.free.reset_ops();
        let index = self.index_of(ptr)?;

        self.free_index(index)
    }

    /// Returns the rank of the block containing the page at `index`.
    ///
    /// For an allocated page this is the rank it was allocated with; for a
    /// free page it is the rank of the free block that contains it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPointer` if `index` is out of range.
    pub fn rank_of_index(&self, index: usize) -> Result<usize, BuddyError> {
        if index >= self.region.num_pages() {
            return Err(BuddyError::InvalidPointer);
        }

        let rank = self.meta.get(index).rank();

        // Every page is covered by a block once `init` returns.
        debug_assert_ne!(rank, 0, "page {index} belongs to no block");

        match rank {
            0 => Err(BuddyError::InvalidPointer),
            rank => Ok(rank),
        }
    }

    /// Returns the rank of the block containing the page at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPointer` if `ptr` is not the start of a page in the
    /// region.
    pub fn rank_of(&self, ptr: NonNull<u8>) -> Result<usize, BuddyError> {
        self.rank_of_index(self.index_of(ptr)?)
    }

    /// Returns whether the page at `ptr` belongs to a free block.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPointer` if `ptr` is not the start of a page in the
    /// region.
    pub fn is_free(&self, ptr: NonNull<u8>) -> Result<bool, BuddyError> {
        let index = self.index_of(ptr)?;

        Ok(self.meta.get(index).is_free)
    }

    /// Returns the number of free blocks of `rank`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRank` if `rank` is outside `1..=MAX_RANK`.
    pub fn free_count(&self, rank: usize) -> Result<usize, BuddyError> {
        Self::check_rank(rank)?;

        Ok(self.free.count(rank))
    }

    /// Returns the number of pages in a block of `rank`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRank` if `rank` is outside `1..=MAX_RANK`.
    pub fn block_pages(rank: usize) -> Result<usize, BuddyError> {
        Self::check_rank(rank)?;

        Ok(Self::pages(rank))
    }

    /// Returns the index of the page starting at `ptr`, if it is in the
    /// region.
    pub fn page_index(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.region.index_of(ptr)
    }

    /// Returns a pointer to the page at `index`, if it is in the region.
    pub fn page_addr(&self, index: usize) -> Option<NonNull<u8>> {
        (index < self.region.num_pages()).then(|| self.region.address_of(index))
    }

    fn index_of(&self, ptr: NonNull<u8>) -> Result<usize, BuddyError> {
        self.region.index_of(ptr).ok_or(BuddyError::InvalidPointer)
    }

    /// Returns the number of pages in the managed region.
    pub fn num_pages(&self) -> usize {
        self.region.num_pages()
    }

    /// Returns the page size in bytes.
    pub const fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    /// Returns the largest rank.
    pub const fn max_rank(&self) -> usize {
        MAX_RANK
    }

    /// Returns a snapshot of the allocator's page accounting.
    pub fn stats(&self) -> BuddyStats {
        let total_pages = self.region.num_pages();

        BuddyStats {
            total_pages,
            free_pages: self.free_pages,
            used_pages: total_pages - self.free_pages,
            last_list_ops: self.free.ops(),
        }
    }

    /// Decomposes the allocator into its base pointer and page count.
    ///
    /// Outstanding allocations remain valid memory, but the allocator no
    /// longer tracks them.
    pub fn into_raw_parts(self) -> (NonNull<u8>, usize) {
        (self.region.ptr(), self.region.num_pages())
    }
}

#[cfg(test)]
impl<const PAGE_SIZE: usize, const MAX_RANK: usize> PageBuddy<PAGE_SIZE, MAX_RANK> {
    /// Scans the whole allocator and panics if any structural invariant is
    /// violated.
    ///
    /// - Blocks tile the region: every page belongs to exactly one aligned block,
    ///   and every page of a block carries the block's rank and free flag.
    /// - A block is on the free list for rank `r` iff it is free with rank `r`.
    /// - Free-list back links mirror forward links and counters match lengths.
    /// - No two free buddies of equal rank coexist.
    /// - The free page total matches the free blocks.
    pub(crate) fn check_invariants(&self) {
        use alloc::{vec, vec::Vec};

        let num_pages = self.num_pages();
        let mut listed = vec![false; num_pages];

        for rank in 1..=MAX_RANK {
            let items: Vec<usize> = self.free.iter(rank).collect();
            assert_eq!(items.len(), self.free.count(rank), "rank {rank} counter");

            for (i, &index) in items.iter().enumerate() {
                let meta = self.meta.get(index);
                assert!(meta.is_free, "listed block {index} not free");
                assert_eq!(meta.rank(), rank, "listed block {index} has wrong rank");
                assert!(!listed[index], "block {index} listed twice");
                listed[index] = true;

                let expected_prev = i.checked_sub(1).map(|p| items[p]);
                assert_eq!(self.free.link(index).prev, expected_prev, "prev of {index}");
            }
        }

        let mut free_pages = 0;
        let mut index = 0;
        while index < num_pages {
            let meta = self.meta.get(index);
            let rank = meta.rank();
            assert!((1..=MAX_RANK).contains(&rank), "page {index} has rank {rank}");

            let pages = 1 << (rank - 1);
            assert_eq!(index % pages, 0, "block {index} misaligned for rank {rank}");
            assert!(index + pages <= num_pages, "block {index} overruns region");

            for interior in index..index + pages {
                assert_eq!(self.meta.get(interior), meta, "page {interior} of block {index}");
            }

            assert_eq!(meta.is_free, listed[index], "free list membership of {index}");

            if meta.is_free {
                free_pages += pages;

                if rank < MAX_RANK {
                    let buddy_index = index ^ pages;
                    if buddy_index < num_pages {
                        let buddy_meta = self.meta.get(buddy_index);
                        assert!(
                            !(buddy_meta.is_free && buddy_meta.rank() == rank),
                            "free buddies {index} and {buddy_index} at rank {rank}"
                        );
                    }
                }
            }

            index += pages;
        }

        let stats = self.stats();
        assert_eq!(stats.free_pages, free_pages);
        assert_eq!(stats.used_pages, num_pages - free_pages);
    }
}

impl<const PAGE_SIZE: usize, const MAX_RANK: usize> fmt::Debug for PageBuddy<PAGE_SIZE, MAX_RANK> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct FreeCounts<'a, const MAX_RANK: usize>(&'a FreeRegistry<MAX_RANK>);

        impl<const MAX_RANK: usize> fmt::Debug for FreeCounts<'_, MAX_RANK> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_map()
                    .entries(
                        (1..=MAX_RANK)
                            .map(|rank| (rank, self.0.count(rank)))
                            .filter(|&(_, count)| count > 0),
                    )
                    .finish()
            }
        }

        f.debug_struct("PageBuddy")
            .field("base", &self.region.ptr())
            .field("num_pages", &self.region.num_pages())
            .field("free_pages", &self.free_pages)
            .field("free_blocks", &FreeCounts(&self.free))
            .finish()
    }
}
