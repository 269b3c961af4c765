//! C5: allocator-internal metadata allocator. A [`Slab`] fixed at the
//! exponent range that covers one `usize` up through eight size classes,
//! used by nothing except this crate's own control blocks (buddy/freelist
//! chain nodes, bank entries). PMM must hand it at least one fast page
//! before it can come up, per `SPEC_FULL.md` §4.5.

use crate::algo::Slab;
use crate::error::KmmResult;

pub struct IAllocator {
    slab: Slab,
}

impl IAllocator {
    pub const fn new() -> Self {
        IAllocator { slab: Slab::new() }
    }

    fn lowest_exp() -> u32 {
        core::mem::size_of::<usize>().trailing_zeros()
    }

    /// Fixes the size classes; must be called once before `seed`/`alloc`.
    /// No page source is ever registered on this slab (see the module
    /// doc): classes only grow through explicit `seed`/`grow` calls.
    pub fn init(&self) -> KmmResult<()> {
        self.slab.init(Self::lowest_exp(), 1)
    }

    /// Donates a raw page (or any backing range) to the smallest size
    /// class. The embedding PMM calls this with a fast page immediately
    /// after `init`.
    ///
    /// # Safety
    /// `base` must point to `len` writable, exclusively owned bytes.
    pub unsafe fn seed(&self, base: u64, len: u64) -> KmmResult<u64> {
        self.slab.grow(Self::lowest_exp(), base, len)
    }

    /// Donates backing memory to a specific size class, for growth beyond
    /// the initial seed.
    ///
    /// # Safety
    /// `base` must point to `len` writable, exclusively owned bytes.
    pub unsafe fn grow(&self, exp: u32, base: u64, len: u64) -> KmmResult<u64> {
        self.slab.grow(exp, base, len)
    }

    pub fn alloc(&self, size: u64) -> KmmResult<u64> {
        self.slab.alloc(size)
    }

    pub fn free(&self, p: u64) -> KmmResult<()> {
        self.slab.free(p)
    }
}

impl Default for IAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide instance. Every other component in this crate that needs
/// to allocate its own control blocks (buddy/freelist chain nodes, bank
/// entries) calls through here rather than the general allocator (C7),
/// per `SPEC_FULL.md` §4.5.
pub static IALLOCATOR: IAllocator = IAllocator::new();

#[cfg(test)]
mod tests {
    use super::*;
    extern crate alloc;

    fn backing(len: usize) -> u64 {
        let layout = core::alloc::Layout::from_size_align(len, 4096).unwrap();
        unsafe { alloc::alloc::alloc_zeroed(layout) as u64 }
    }

    #[test]
    fn seeds_and_serves_control_block_sized_allocations() {
        let ia = IAllocator::new();
        ia.init().unwrap();
        unsafe { ia.seed(backing(4096), 4096).unwrap() };

        let a = ia.alloc(core::mem::size_of::<usize>() as u64).unwrap();
        let b = ia.alloc(64).unwrap();
        assert_ne!(a, b);
        ia.free(a).unwrap();
        ia.free(b).unwrap();
    }
}
