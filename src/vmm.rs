//! C7 (second half): VMM facade. Wraps a buddy or a watermark over a
//! virtual range and, optionally, calls the pager on each allocation,
//! rolling back the virtual-range reservation if the pager rejects it.

use crate::algo::{Buddy, Watermark};
use crate::error::{KmmError, KmmResult};
use crate::pager::{MapFlags, Pager};

enum VmmBacking {
    Buddy(Buddy),
    Watermark(Watermark),
}

/// One virtual range plus whichever allocator strategy manages it.
pub struct VmmMeta {
    backing: VmmBacking,
}

impl VmmMeta {
    /// A power-of-two-managed virtual range `[base, base + (1 << max_exp))`.
    ///
    /// # Safety
    /// `base` must name `1 << max_exp` bytes of virtual address space this
    /// `VmmMeta` will exclusively own the reservation bookkeeping for (the
    /// pager is responsible for whether it is actually mapped).
    pub unsafe fn new_buddy(base: u64, max_exp: u32, min_exp: u32) -> KmmResult<Self> {
        let buddy = Buddy::new();
        buddy.add(base, max_exp, min_exp)?;
        Ok(VmmMeta { backing: VmmBacking::Buddy(buddy) })
    }

    /// A bump-only virtual range `[base, base + len)`. Never supports free.
    ///
    /// # Safety
    /// `base` must name `len` bytes of virtual address space.
    pub unsafe fn new_watermark(base: u64, len: u64) -> KmmResult<Self> {
        let wm = Watermark::new();
        wm.init(base, len)?;
        Ok(VmmMeta { backing: VmmBacking::Watermark(wm) })
    }

    /// Reserves `n` bytes of virtual address space and asks `pager` to map
    /// them. On pager failure, the virtual reservation is rolled back
    /// (watermark reservations cannot be rolled back, so a watermark-backed
    /// `VmmMeta` surfaces the pager's error without one; callers needing
    /// rollback on a bump region should not map it speculatively).
    pub fn alloc(&self, n: u64, pager: &dyn Pager, flags: MapFlags) -> KmmResult<u64> {
        let va = match &self.backing {
            VmmBacking::Buddy(b) => b.alloc(n)?,
            VmmBacking::Watermark(w) => w.alloc(n)?,
        };

        match pager.fly_map(va as usize, n as usize, flags) {
            Ok(()) => Ok(va),
            Err(err) => {
                if let VmmBacking::Buddy(b) = &self.backing {
                    let _ = b.free(va);
                }
                Err(err)
            }
        }
    }

    /// Unmaps and releases `[p, p + n)`. Only valid for buddy-backed
    /// ranges; watermark ranges never free.
    pub fn free(&self, p: u64, n: u64, pager: &dyn Pager) -> KmmResult<()> {
        match &self.backing {
            VmmBacking::Buddy(b) => {
                pager.fly_unmap(p as usize, n as usize)?;
                b.free(p)?;
                Ok(())
            }
            VmmBacking::Watermark(_) => Err(KmmError::Unimplemented),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::BuddyStats;
    use crate::pager::{FailingPager, NullPager};

    extern crate alloc;

    fn backing(len: usize, align: usize) -> u64 {
        let layout = core::alloc::Layout::from_size_align(len, align).unwrap();
        unsafe { alloc::alloc::alloc_zeroed(layout) as u64 }
    }

    fn buddy_stats(meta: &VmmMeta) -> BuddyStats {
        match &meta.backing {
            VmmBacking::Buddy(b) => b.stats(),
            VmmBacking::Watermark(_) => unreachable!(),
        }
    }

    /// S6: a pager that fails every call leaves the underlying buddy's
    /// free-list state exactly as it was before the call (net zero: one
    /// allocation immediately undone by one rollback free).
    #[test]
    fn s6_vmm_rollback_on_pager_failure() {
        let base = backing(4096, 4096);
        let meta = unsafe { VmmMeta::new_buddy(base, 12, 12).unwrap() };
        let pager = FailingPager;

        let result = meta.alloc(4096, &pager, MapFlags::WRITABLE);
        assert_eq!(result, Err(KmmError::PagerFailure));

        let stats = buddy_stats(&meta);
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.frees, 1);

        // The region must still be usable exactly as before: a subsequent
        // alloc against a working pager succeeds at the same address.
        let ok_pager = NullPager;
        let p = meta.alloc(4096, &ok_pager, MapFlags::WRITABLE).unwrap();
        assert_eq!(p, base);
    }

    #[test]
    fn watermark_backed_vmm_never_frees() {
        let base = backing(256, 16);
        let meta = unsafe { VmmMeta::new_watermark(base, 256).unwrap() };
        let pager = NullPager;
        let p = meta.alloc(64, &pager, MapFlags::empty()).unwrap();
        assert_eq!(meta.free(p, 64, &pager), Err(KmmError::Unimplemented));
    }
}
