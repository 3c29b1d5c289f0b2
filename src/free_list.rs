//! Per-rank free lists linked by page index.
//!
//! Each rank owns a doubly linked list of the free blocks of that rank. Links
//! live in a side table indexed by the page index of each block's first page,
//! so a block can be unlinked in constant time given only its index.

use alloc::{boxed::Box, vec};

/// A double link in a linked list of free blocks.
///
/// Only the entry at the first page of a free block is meaningful.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DoubleBlockLink {
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

pub struct FreeRegistry<const MAX_RANK: usize> {
    /// Head of the free list of each rank. Rank `r` lives at `r - 1`.
    heads: [Option<usize>; MAX_RANK],
    /// Number of blocks on each free list.
    counts: [usize; MAX_RANK],
    links: Box<[DoubleBlockLink]>,
    /// Link operations performed since the last call to `reset_ops`.
    ops: usize,
}

impl<const MAX_RANK: usize> FreeRegistry<MAX_RANK> {
    /// Creates an empty registry for a region of `num_pages` pages.
    pub fn new(num_pages: usize) -> FreeRegistry<MAX_RANK> {
        FreeRegistry {
            heads: [None; MAX_RANK],
            counts: [0; MAX_RANK],
            links: vec![DoubleBlockLink::default(); num_pages].into_boxed_slice(),
            ops: 0,
        }
    }

    #[inline]
    fn slot(rank: usize) -> usize {
        debug_assert!((1..=MAX_RANK).contains(&rank), "rank {rank} out of range");
        rank - 1
    }

    /// Makes the block at `index` the head of the free list for `rank`.
    pub fn push_front(&mut self, rank: usize, index: usize) {
        let slot = Self::slot(rank);
        let old_head = self.heads[slot];

        debug_assert_ne!(old_head, Some(index), "block {index} pushed twice");

        if let Some(old) = old_head {
            // `old_head` points back to the new head.
            self.links[old].prev = Some(index);
        }

        // The new head points forward to `old_head`.
        self.links[index] = DoubleBlockLink {
            prev: None,
            next: old_head,
        };

        self.heads[slot] = Some(index);
        self.counts[slot] += 1;
        self.ops += 1;
    }

    /// Unlinks the block at `index` from the free list for `rank`.
    ///
    /// The block must be an element of that list.
    pub fn remove(&mut self, rank: usize, index: usize) {
        let slot = Self::slot(rank);
        let removed = core::mem::take(&mut self.links[index]);

        match removed.prev {
            // Link `prev` forward to `next`.
            Some(p) => self.links[p].next = removed.next,

            // If there's no previous block, then `removed` is the head of the
            // free list.
            None => {
                debug_assert_eq!(self.heads[slot], Some(index), "block {index} not in list");
                self.heads[slot] = removed.next;
            }
        }

        if let Some(n) = removed.next {
            // Link `next` back to `prev`. If `removed` was the head, this
            // clears the new head's back link.
            self.links[n].prev = removed.prev;
        }

        self.counts[slot] -= 1;
        self.ops += 1;
    }

    /// Removes and returns the head of the free list for `rank`.
    pub fn pop_front(&mut self, rank: usize) -> Option<usize> {
        let head = self.heads[Self::slot(rank)]?;
        self.remove(rank, head);
        Some(head)
    }

    /// Returns the number of free blocks of `rank`.
    #[inline]
    pub fn count(&self, rank: usize) -> usize {
        self.counts[Self::slot(rank)]
    }

    /// Returns the number of link operations since the last reset.
    #[inline]
    pub fn ops(&self) -> usize {
        self.ops
    }

    #[inline]
    pub fn reset_ops(&mut self) {
        self.ops = 0;
    }

    /// Walks the free list for `rank` from head to tail.
    #[cfg(test)]
    pub fn iter(&self, rank: usize) -> impl Iterator<Item = usize> + '_ {
        let mut cur = self.heads[Self::slot(rank)];

        core::iter::from_fn(move || {
            let index = cur?;
            cur = self.links[index].next;
            Some(index)
        })
    }

    #[cfg(test)]
    pub fn link(&self, index: usize) -> DoubleBlockLink {
        self.links[index]
    }
}
