//! A fixed-region buddy page allocator.
//!
//! [`PageBuddy`] manages a region of equally sized pages and hands out blocks
//! of `2^(rank - 1)` contiguous pages, where the rank ranges from 1 to
//! `MAX_RANK`. Freed blocks are eagerly coalesced with their buddies, so free
//! memory is always held as the coarsest possible set of aligned blocks.
//!
//! The allocator never touches the managed memory. Free lists are linked by
//! page index through a side table owned by the allocator, which makes every
//! operation safe to call with arbitrary pointers: a bad pointer is reported
//! as an error rather than corrupting the free lists.
//!
//! ```
//! use core::ptr::NonNull;
//! use page_buddy::{BuddyError, DefaultPageBuddy};
//!
//! let mut region = vec![0u8; 16 * 4096];
//! let base = NonNull::new(region.as_mut_ptr()).unwrap();
//!
//! let mut buddy = DefaultPageBuddy::init(base, 16).unwrap();
//! assert_eq!(buddy.free_count(5), Ok(1));
//!
//! let block = buddy.allocate(2).unwrap();
//! assert_eq!(buddy.rank_of(block), Ok(2));
//!
//! buddy.free(block).unwrap();
//! assert_eq!(buddy.free(block), Err(BuddyError::DoubleFree));
//! assert_eq!(buddy.free_count(5), Ok(1));
//! ```
//!
//! ## Characteristics
//!
//! | Operation                | Free-list operations |
//! |--------------------------|----------------------|
//! | Allocate                 | at most `MAX_RANK`   |
//! | Free                     | at most `MAX_RANK`   |
//! | Rank query               | none                 |
//! | Free block count         | none                 |

#![doc(html_root_url = "https://docs.rs/page_buddy/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]
// This is necessary to allow `sptr` and `polyfill` to shadow methods provided
// by newer toolchains.
#![allow(unstable_name_collisions)]

extern crate alloc;

pub mod buddy;
mod free_list;
mod meta;
mod polyfill;
mod region;
mod stats;


use core::fmt;

pub use crate::{
    buddy::{DefaultPageBuddy, PageBuddy},
    stats::BuddyStats,
};

/// `EINVAL`, as reported by [`BuddyError::errno`].
pub const EINVAL: i32 = 22;

/// `ENOSPC`, as reported by [`BuddyError::errno`].
pub const ENOSPC: i32 = 28;

/// The error type for allocator operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BuddyError {
    /// The requested rank is outside `1..=MAX_RANK`.
    InvalidRank,

    /// The pointer does not refer to the start of a block in the region.
    ///
    /// This variant is returned for pointers before the base or past the end
    /// of the region, pointers that are not page-aligned relative to the base,
    /// and pointers into the interior of an allocated block.
    InvalidPointer,

    /// The block being freed is already free.
    DoubleFree,

    /// No free block is large enough to satisfy the request.
    OutOfMemory,

    /// The region has more pages than the allocator's metadata can track.
    CapacityExceeded,

    /// The region extends past the end of the address space.
    InvalidRegion,
}

impl BuddyError {
    /// Returns the negative status code a C page allocator would report for
    /// this error.
    ///
    /// Exhaustion maps to `-ENOSPC`; every other error maps to `-EINVAL`.
    pub fn errno(self) -> i32 {
        match self {
            BuddyError::OutOfMemory => -ENOSPC,
            BuddyError::InvalidRank
            | BuddyError::InvalidPointer
            | BuddyError::DoubleFree
            | BuddyError::CapacityExceeded
            | BuddyError::InvalidRegion => -EINVAL,
        }
    }
}

impl fmt::Display for BuddyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            BuddyError::InvalidRank => "rank out of range",
            BuddyError::InvalidPointer => "pointer does not refer to a block in the region",
            BuddyError::DoubleFree => "block is already free",
            BuddyError::OutOfMemory => "no free block large enough",
            BuddyError::CapacityExceeded => "region exceeds metadata capacity",
            BuddyError::InvalidRegion => "region overflows the address space",
        };

        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for BuddyError {}
