//! Cross-module integration test exercising `init_kmm` end-to-end against a
//! small synthetic memory map, mirroring the teacher's
//! `tests/kernel/src/integration/memory.rs` placement.

extern crate alloc;

use crate::pmm::{BiasEntry, BiasTable, MemoryKind, MemoryMapEntry};
use crate::{allocator, init_kmm, stage, KmmStage};

fn backing(len: usize, align: usize) -> u64 {
    let layout = core::alloc::Layout::from_size_align(len, align).unwrap();
    unsafe { alloc::alloc::alloc_zeroed(layout) as u64 }
}

#[test]
fn init_kmm_brings_up_the_full_stack() {
    let phys = backing(8 * 1024 * 1024, 1 << 21);
    let low_mem_limit = phys; // everything in this map is "high"
    let map = [MemoryMapEntry { base: phys, len: 8 * 1024 * 1024, kind: MemoryKind::Available }];

    let bias_high = BiasTable::new(alloc::vec![BiasEntry {
        exp: 12,
        min_blocks: 4,
        ratio_num: 1,
        ratio_den: 1,
        min_buddy_exp: 12,
    }]);
    let bias_low = BiasTable::new(alloc::vec![]);

    let bootstrap_base = backing(4096, 16);

    unsafe {
        init_kmm(&map, low_mem_limit, &bias_low, &bias_high, (bootstrap_base, 4096), 5, 1).unwrap();
    }

    assert_eq!(stage(), KmmStage::Ready);

    // init_kmm only seeds the smallest SLAB class (exp 5, 32-byte objects);
    // the 2048-byte (exp 11) class was never grown by hand, so serving it
    // exercises `Slab::alloc`'s empty-class refill from the PMM.

    // S5: PAGE_SIZE = 4096. alloc(2049) routes to PMM, alloc(2048) routes to
    // the SLAB; each frees only through the allocator that actually served
    // it.
    let from_pmm = allocator::kalloc(2049).unwrap();
    let from_slab = allocator::kalloc(2048).unwrap();
    assert_ne!(from_pmm, from_slab);

    assert_eq!(allocator::slab().free(from_pmm), Err(crate::KmmError::NotFound));
    assert_eq!(allocator::kfree(from_pmm), Ok(()));
    assert_eq!(allocator::kfree(from_slab), Ok(()));

    // A request within the seeded 32-byte class routes through the SLAB.
    let small = allocator::kalloc(16).unwrap();
    allocator::kfree(small).unwrap();

    // Large request routes through the PMM.
    let large = allocator::kalloc(3000).unwrap();
    allocator::kfree(large).unwrap();

    // Re-entering init_kmm after it has already advanced past Cold is
    // rejected rather than silently re-running bootstrap.
    let second_attempt =
        unsafe { init_kmm(&map, low_mem_limit, &bias_low, &bias_high, (bootstrap_base, 4096), 5, 1) };
    assert!(second_attempt.is_err());
}
