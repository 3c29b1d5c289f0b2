//! Allocator statistics.

/// A snapshot of an allocator's page accounting.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BuddyStats {
    /// Pages in the managed region.
    pub total_pages: usize,
    /// Pages in free blocks.
    pub free_pages: usize,
    /// Pages in allocated blocks.
    pub used_pages: usize,
    /// Free-list operations performed by the most recent allocate or free.
    ///
    /// Each successful call performs at most `MAX_RANK` of these. A call that
    /// fails performs none.
    pub last_list_ops: usize,
}

impl BuddyStats {
    /// Returns the fraction of the region that is allocated, from 0.0 to 1.0.
    pub fn utilization(&self) -> f64 {
        if self.total_pages == 0 {
            return 0.0;
        }

        self.used_pages as f64 / self.total_pages as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization_of_empty_region_is_zero() {
        assert_eq!(BuddyStats::default().utilization(), 0.0);
    }

    #[test]
    fn utilization_is_used_over_total() {
        let stats = BuddyStats {
            total_pages: 8,
            free_pages: 6,
            used_pages: 2,
            last_list_ops: 0,
        };

        assert_eq!(stats.utilization(), 0.25);
    }
}
