#![no_main]

use std::ptr::NonNull;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use page_buddy::{BuddyError, PageBuddy};
use sptr::invalid_mut;

const PAGE_SIZE: usize = 4096;
const MAX_RANK: usize = 11;

const BASE: usize = 0x1000_0000;

type Buddy = PageBuddy<PAGE_SIZE, MAX_RANK>;

#[derive(Clone, Debug, Arbitrary)]
enum BuddyOp {
    Allocate(u8),
    /// Frees the outstanding allocation at this index, modulo their count.
    Free(usize),
    /// Frees an arbitrary page index, which may be free, interior or out of
    /// range.
    FreeRaw(u16),
    RankOf(u16),
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    num_pages: u16,
    ops: Vec<BuddyOp>,
}

fn page(index: usize) -> NonNull<u8> {
    NonNull::new(invalid_mut::<u8>(BASE + index * PAGE_SIZE)).unwrap()
}

fuzz_target!(|args: Args| {
    let num_pages = usize::from(args.num_pages);
    let base = page(0);

    let mut alloc = match Buddy::init(base, num_pages) {
        Ok(a) => a,
        Err(BuddyError::CapacityExceeded) => {
            assert!(num_pages > Buddy::capacity());
            return;
        }
        Err(e) => panic!("unexpected init error: {e}"),
    };

    let initial: Vec<usize> = (1..=MAX_RANK)
        .map(|rank| alloc.free_count(rank).unwrap())
        .collect();

    let mut outstanding = Vec::new();

    for op in args.ops {
        match op {
            BuddyOp::Allocate(rank) => {
                let rank = usize::from(rank);
                match alloc.allocate(rank) {
                    Ok(block) => {
                        assert_eq!(alloc.rank_of(block), Ok(rank));
                        outstanding.push(block);
                    }
                    Err(BuddyError::InvalidRank) => assert!(rank == 0 || rank > MAX_RANK),
                    Err(BuddyError::OutOfMemory) => {
                        assert!((rank..=MAX_RANK).all(|r| alloc.free_count(r) == Ok(0)))
                    }
                    Err(e) => panic!("unexpected allocate error: {e}"),
                }
            }

            BuddyOp::Free(raw_idx) => {
                if outstanding.is_empty() {
                    continue;
                }

                let idx = raw_idx % outstanding.len();
                let block = outstanding.swap_remove(idx);
                alloc.free(block).unwrap();
            }

            BuddyOp::FreeRaw(index) => {
                let index = usize::from(index);
                let was_outstanding = outstanding.contains(&page(index));

                match alloc.free(page(index)) {
                    Ok(()) => {
                        assert!(was_outstanding);
                        outstanding.retain(|&b| b != page(index));
                    }
                    Err(_) => assert!(!was_outstanding),
                }
            }

            BuddyOp::RankOf(index) => {
                let index = usize::from(index);
                match alloc.rank_of(page(index)) {
                    Ok(rank) => assert!(index < num_pages && (1..=MAX_RANK).contains(&rank)),
                    Err(e) => {
                        assert_eq!(e, BuddyError::InvalidPointer);
                        assert!(index >= num_pages);
                    }
                }
            }
        }

        assert!(alloc.stats().last_list_ops <= MAX_RANK);
    }

    for block in outstanding {
        alloc.free(block).unwrap();
    }

    let last: Vec<usize> = (1..=MAX_RANK)
        .map(|rank| alloc.free_count(rank).unwrap())
        .collect();
    assert_eq!(initial, last);
    assert_eq!(alloc.stats().free_pages, num_pages);
});
