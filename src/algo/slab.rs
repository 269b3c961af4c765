//! C4: SLAB size-class allocator. Eight [`Freelist`] chains at contiguous
//! power-of-two object sizes starting at `lowest_exp`, grounded in the
//! source's `pslab.c`.

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::algo::freelist::Freelist;
use crate::arch::PAGE_SIZE;
use crate::error::{KmmError, KmmResult};

const NUM_LISTS: usize = 8;
const UNINIT_EXP: u32 = u32::MAX;

#[derive(Default, Clone, Copy, Debug)]
pub struct SlabStats {
    pub free_per_list: [u64; NUM_LISTS],
}

/// Supplies fresh backing pages to [`Slab::expand`]. The embedding
/// allocator wires this to the PMM; `algo` stays free of any PMM
/// dependency, the same way the crate's `Arch`/`Pager` traits keep it free
/// of a hard architecture dependency.
pub trait SlabPageSource: Sync {
    /// Returns a fresh, exclusively-owned, zeroed region of at least `len`
    /// bytes.
    fn alloc_pages(&self, len: u64) -> KmmResult<u64>;
}

/// Eight size classes: `lowest_exp .. lowest_exp + 7`. Each class is itself
/// a full [`Freelist`] chain, so a class can be grown with more than one
/// backing region over its lifetime.
pub struct Slab {
    lists: [Freelist; NUM_LISTS],
    lowest_exp: AtomicU32,
    pages_per_list: AtomicU32,
    page_source: Mutex<Option<&'static dyn SlabPageSource>>,
}

impl Slab {
    pub const fn new() -> Self {
        Slab {
            lists: [
                Freelist::new(),
                Freelist::new(),
                Freelist::new(),
                Freelist::new(),
                Freelist::new(),
                Freelist::new(),
                Freelist::new(),
                Freelist::new(),
            ],
            lowest_exp: AtomicU32::new(UNINIT_EXP),
            pages_per_list: AtomicU32::new(1),
            page_source: Mutex::new(None),
        }
    }

    /// Fixes the size classes at `[1 << lowest_exp, .. , 1 << (lowest_exp + 7)]`
    /// and the default growth increment `expand` uses when `alloc` retries
    /// on an empty class. Must be called exactly once before any
    /// `grow`/`alloc`/`free` call.
    pub fn init(&self, lowest_exp: u32, pages_per_list: u32) -> KmmResult<()> {
        if self
            .lowest_exp
            .compare_exchange(UNINIT_EXP, lowest_exp, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(KmmError::InvalidParameters);
        }
        self.pages_per_list.store(pages_per_list.max(1), Ordering::Release);
        Ok(())
    }

    /// Registers the page source `expand` draws from. Without one,
    /// `expand`/`alloc`'s auto-retry are no-ops and classes must be grown
    /// by hand via `grow` — this is the iallocator's (C5) mode, which must
    /// never call back into the PMM while it's still bootstrapping it.
    pub fn set_page_source(&self, source: &'static dyn SlabPageSource) {
        *self.page_source.lock() = Some(source);
    }

    fn class_index(&self, exp: u32) -> KmmResult<usize> {
        let lowest = self.lowest_exp.load(Ordering::Acquire);
        if lowest == UNINIT_EXP || exp < lowest || exp >= lowest + NUM_LISTS as u32 {
            return Err(KmmError::InvalidParameters);
        }
        Ok((exp - lowest) as usize)
    }

    /// Donates `[base, base+len)` of backing memory to the size class for
    /// object exponent `exp` (i.e. objects of size `1 << exp`).
    ///
    /// # Safety
    /// `base` must point to `len` writable, exclusively owned bytes.
    pub unsafe fn grow(&self, exp: u32, base: u64, len: u64) -> KmmResult<u64> {
        let idx = self.class_index(exp)?;
        self.lists[idx].init(base, len, 1u64 << exp)
    }

    /// Grows every size class by `pages_per_list` PMM-sized pages, via the
    /// registered [`SlabPageSource`]. Returns `0` on full success, or the
    /// 1-based index of the first slot that failed to grow — slots before
    /// it already succeeded and remain usable. Returns `1` if no page
    /// source is registered or the slab hasn't been `init`ialised.
    pub fn expand(&self, pages_per_list: u32) -> u32 {
        let lowest = self.lowest_exp.load(Ordering::Acquire);
        if lowest == UNINIT_EXP || pages_per_list == 0 {
            return 1;
        }
        let source = match *self.page_source.lock() {
            Some(s) => s,
            None => return 1,
        };

        for i in 0..NUM_LISTS {
            let exp = lowest + i as u32;
            let region_len = (pages_per_list as u64) * (PAGE_SIZE as u64);
            let grown = source
                .alloc_pages(region_len)
                .and_then(|addr| unsafe { self.lists[i].init(addr, region_len, 1u64 << exp) });
            if grown.is_err() {
                return i as u32 + 1;
            }
        }
        0
    }

    /// Allocates one object of at least `size` bytes, rounding up to the
    /// smallest covered size class. On an empty class, grows every class by
    /// one page per slot (via the registered page source) and retries once.
    pub fn alloc(&self, size: u64) -> KmmResult<u64> {
        let lowest = self.lowest_exp.load(Ordering::Acquire);
        if lowest == UNINIT_EXP {
            return Err(KmmError::InvalidParameters);
        }
        let mut exp = lowest;
        while (1u64 << exp) < size {
            exp += 1;
            if exp >= lowest + NUM_LISTS as u32 {
                return Err(KmmError::InvalidParameters);
            }
        }
        let idx = (exp - lowest) as usize;
        match self.lists[idx].alloc() {
            Err(KmmError::OutOfMemory) => {
                self.expand(self.pages_per_list.load(Ordering::Acquire));
                self.lists[idx].alloc()
            }
            other => other,
        }
    }

    /// Frees `p`, trying every size class's chain until one recognises the
    /// address as belonging to it.
    pub fn free(&self, p: u64) -> KmmResult<()> {
        for list in &self.lists {
            match list.free(p) {
                Ok(()) => return Ok(()),
                Err(KmmError::NotFound) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(KmmError::NotFound)
    }

    pub fn stats(&self) -> SlabStats {
        let mut free_per_list = [0u64; NUM_LISTS];
        for (i, list) in self.lists.iter().enumerate() {
            free_per_list[i] = list.free_count();
        }
        SlabStats { free_per_list }
    }
}

impl Default for Slab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate alloc;

    fn backing(len: usize) -> u64 {
        let layout = core::alloc::Layout::from_size_align(len, 4096).unwrap();
        unsafe { alloc::alloc::alloc_zeroed(layout) as u64 }
    }

    struct HostPageSource;

    impl SlabPageSource for HostPageSource {
        fn alloc_pages(&self, len: u64) -> KmmResult<u64> {
            Ok(backing(len as usize))
        }
    }

    #[test]
    fn routes_by_size_class() {
        let slab = Slab::new();
        slab.init(5, 1).unwrap(); // size classes 32 .. 4096

        unsafe {
            slab.grow(5, backing(4096), 4096).unwrap(); // 32-byte objects
            slab.grow(8, backing(8192), 8192).unwrap(); // 256-byte objects
        }

        let small = slab.alloc(20).unwrap();
        let big = slab.alloc(200).unwrap();
        assert_ne!(small, big);

        slab.free(small).unwrap();
        slab.free(big).unwrap();
    }

    #[test]
    fn alloc_outside_class_range_is_rejected() {
        let slab = Slab::new();
        slab.init(5, 1).unwrap(); // covers up to 1 << 12 = 4096
        assert_eq!(slab.alloc(1 << 20), Err(KmmError::InvalidParameters));
    }

    #[test]
    fn double_init_rejected() {
        let slab = Slab::new();
        slab.init(5, 1).unwrap();
        assert_eq!(slab.init(6, 1), Err(KmmError::InvalidParameters));
    }

    #[test]
    fn free_unknown_address_not_found() {
        let slab = Slab::new();
        slab.init(5, 1).unwrap();
        unsafe { slab.grow(5, backing(4096), 4096).unwrap() };
        assert_eq!(slab.free(0xdead_beef), Err(KmmError::NotFound));
    }

    #[test]
    fn alloc_on_empty_class_expands_from_page_source_and_retries() {
        static SOURCE: HostPageSource = HostPageSource;
        let slab = Slab::new();
        slab.init(5, 1).unwrap();
        slab.set_page_source(&SOURCE);

        // No class was ever `grow`n by hand; `alloc` must refill via the
        // page source on its own.
        let p = slab.alloc(20).unwrap();
        slab.free(p).unwrap();
    }

    #[test]
    fn expand_without_page_source_reports_failure() {
        let slab = Slab::new();
        slab.init(5, 1).unwrap();
        assert_eq!(slab.expand(1), 1);
    }
}
