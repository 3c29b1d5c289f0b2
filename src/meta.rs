use alloc::{boxed::Box, vec};

use crate::BuddyError;

/// Per-page bookkeeping.
///
/// Every page of a block carries the block's rank and free flag. Only the
/// entry at the block's first page is consulted when deciding whether to
/// merge; the others let a query on any page find the containing block's rank
/// without searching.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PageMeta {
    /// The rank of the containing block, or 0 if the page is not tracked.
    rank: u8,
    pub is_free: bool,
}

impl PageMeta {
    /// Returns the rank of the containing block, or 0 if the page is not
    /// tracked.
    #[inline]
    pub fn rank(self) -> usize {
        usize::from(self.rank)
    }
}

pub struct PageMetaTable {
    entries: Box<[PageMeta]>,
}

impl PageMetaTable {
    /// Creates a table of `num_pages` untracked entries.
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` if `num_pages` is greater than `capacity`.
    pub fn new(num_pages: usize, capacity: usize) -> Result<PageMetaTable, BuddyError> {
        if num_pages > capacity {
            return Err(BuddyError::CapacityExceeded);
        }

        Ok(PageMetaTable {
            entries: vec![PageMeta::default(); num_pages].into_boxed_slice(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn get(&self, index: usize) -> PageMeta {
        self.entries[index]
    }

    #[inline]
    pub fn set_rank(&mut self, index: usize, rank: usize) {
        debug_assert!(rank <= usize::from(u8::MAX));
        self.entries[index].rank = rank as u8;
    }

    #[inline]
    pub fn set_free(&mut self, index: usize, is_free: bool) {
        self.entries[index].is_free = is_free;
    }

    /// Stamps `rank` and `is_free` onto the `pages` entries beginning at
    /// `start`.
    pub fn mark(&mut self, start: usize, pages: usize, rank: usize, is_free: bool) {
        for index in start..start + pages {
            self.set_rank(index, rank);
            self.set_free(index, is_free);
        }
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = PageMeta> + '_ {
        self.entries.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_enforces_capacity() {
        assert!(PageMetaTable::new(8, 8).is_ok());
        assert_eq!(
            PageMetaTable::new(9, 8).err(),
            Some(BuddyError::CapacityExceeded)
        );
    }

    #[test]
    fn entries_start_untracked() {
        let table = PageMetaTable::new(4, 4).unwrap();

        assert_eq!(table.len(), 4);
        assert!(table.iter().all(|m| m == PageMeta::default()));
        assert_eq!(table.get(3).rank(), 0);
    }

    #[test]
    fn mark_stamps_only_the_given_range() {
        let mut table = PageMetaTable::new(8, 8).unwrap();
        table.mark(4, 2, 2, true);

        for i in 0..8 {
            let expected = if (4..6).contains(&i) {
                PageMeta {
                    rank: 2,
                    is_free: true,
                }
            } else {
                PageMeta::default()
            };
            assert_eq!(table.get(i), expected, "page {i}");
        }
    }

    #[test]
    fn setters_touch_one_entry() {
        let mut table = PageMetaTable::new(2, 2).unwrap();
        table.set_rank(1, 3);
        table.set_free(1, true);

        assert_eq!(table.get(0), PageMeta::default());
        assert_eq!(table.get(1).rank(), 3);
        assert_eq!(
            table.get(1),
            PageMeta {
                rank: 3,
                is_free: true
            }
        );
    }
}
