//! C6: physical memory manager. Weaves freelists and buddies together per
//! a bias table, over two independent low/high regions (see `SPEC_FULL.md`
//! §4.6 "Low/high duality"), plus a fast-page pool per region.
//!
//! The per-exponent freelist/buddy index tables the source carves out of a
//! bootstrap watermark are, here, ordinary heap-backed `Vec`s owned by the
//! `Pmm` value itself: this crate's own control-plane bookkeeping is not
//! subject to the "no heap yet" constraint that the *pages it hands out*
//! are (those still come straight out of the boot memory map, never out
//! of `alloc`). See `DESIGN.md` for the full rationale.

extern crate alloc;

use alloc::vec::Vec;

use spin::Mutex;

use crate::algo::{Buddy, Freelist};
use crate::arch::PAGE_SIZE_LOWEST_EXPONENT;
use crate::error::{KmmError, KmmResult};
use crate::hhdm;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    Available,
    Reserved,
}

#[derive(Clone, Copy, Debug)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub len: u64,
    pub kind: MemoryKind,
}

#[derive(Clone, Copy, Debug)]
pub struct BiasEntry {
    pub exp: u32,
    pub min_blocks: u32,
    pub ratio_num: u32,
    pub ratio_den: u32,
    pub min_buddy_exp: u32,
}

#[derive(Clone, Debug, Default)]
pub struct BiasTable(pub Vec<BiasEntry>);

impl BiasTable {
    pub fn new(entries: Vec<BiasEntry>) -> Self {
        BiasTable(entries)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmmRegionKind {
    Low,
    High,
}

fn align_down(n: u64, align: u64) -> u64 {
    n - (n % align)
}

fn align_up(n: u64, align: u64) -> u64 {
    align_down(n + align - 1, align)
}

fn exp_for_size(size: u64) -> u32 {
    let mut e = PAGE_SIZE_LOWEST_EXPONENT;
    while (1u64 << e) < size {
        e += 1;
    }
    e
}

struct PmmRegion {
    freelists: Vec<(u32, Freelist)>,
    buddies: Mutex<Vec<(u32, Buddy)>>,
    fast_pages: Freelist,
    bias: Vec<BiasEntry>,
}

impl PmmRegion {
    fn carve(entries: &[MemoryMapEntry], low_mem_limit: u64, kind: PmmRegionKind, bias: &BiasTable) -> KmmResult<Self> {
        let mut freelists: Vec<(u32, Freelist)> = bias.0.iter().map(|b| (b.exp, Freelist::new())).collect();
        let fast_pages = Freelist::new();
        let smallest = 1u64 << PAGE_SIZE_LOWEST_EXPONENT;

        for entry in entries {
            if entry.kind != MemoryKind::Available {
                continue;
            }
            let entry_is_low = entry.base < low_mem_limit;
            let wants_low = kind == PmmRegionKind::Low;
            if entry_is_low != wants_low {
                continue;
            }

            let mut base = entry.base;
            let mut len = entry.len;

            for b in &bias.0 {
                if b.ratio_num == 0 || b.ratio_den == 0 {
                    continue;
                }
                let block = 1u64 << b.exp;
                if len < (b.min_blocks as u64) * block {
                    continue;
                }
                let want = (len as u128 * b.ratio_num as u128 / b.ratio_den as u128) as u64;
                let reserved = align_down(want.min(len), block);
                if reserved < block {
                    continue;
                }

                // `base` is only page-aligned; a freelist object popped out
                // of it and handed to `Buddy::add` later must be aligned to
                // `block` (the XOR-buddy math's precondition), so the
                // region itself is pushed up to a `block`-aligned start
                // before it's carved.
                let aligned_base = align_up(base, block);
                let waste = aligned_base - base;
                let usable = if waste < reserved { align_down(reserved - waste, block) } else { 0 };

                if usable >= block {
                    if let Some((_, fl)) = freelists.iter_mut().find(|(e, _)| *e == b.exp) {
                        unsafe {
                            fl.init(hhdm::to_hhdm(aligned_base), usable, block)?;
                        }
                    }
                }
                base += reserved;
                len -= reserved;
            }

            let residual = align_down(len, smallest);
            if residual >= smallest {
                unsafe {
                    fast_pages.init(hhdm::to_hhdm(base), residual, smallest)?;
                }
            }
        }

        Ok(PmmRegion { freelists, buddies: Mutex::new(Vec::new()), fast_pages, bias: bias.0.clone() })
    }

    fn freelist_for(&self, exp: u32) -> Option<&Freelist> {
        self.freelists.iter().find(|(e, _)| *e == exp).map(|(_, f)| f)
    }

    fn alloc(&self, size: u64) -> KmmResult<u64> {
        let e = exp_for_size(size);

        if e == PAGE_SIZE_LOWEST_EXPONENT {
            if let Ok(p) = self.fast_pages.alloc() {
                return Ok(p);
            }
        }

        if let Some(fl) = self.freelist_for(e) {
            if let Ok(p) = fl.alloc() {
                return Ok(p);
            }
        }

        {
            let buddies = self.buddies.lock();
            if let Some((_, b)) = buddies.iter().find(|(be, _)| *be == e) {
                if let Ok(p) = b.alloc(1u64 << e) {
                    return Ok(p);
                }
            }
        }

        let mut candidates: Vec<u32> = self.bias.iter().map(|b| b.exp).filter(|&t| t > e).collect();
        candidates.sort_unstable();
        candidates.dedup();

        for t in candidates {
            let existing = {
                let buddies = self.buddies.lock();
                buddies.iter().any(|(be, _)| *be == t)
            };
            if existing {
                let buddies = self.buddies.lock();
                if let Some((_, b)) = buddies.iter().find(|(be, _)| *be == t) {
                    if let Ok(p) = b.alloc(size) {
                        return Ok(p);
                    }
                }
                continue;
            }

            if let Some(fl) = self.freelist_for(t) {
                if let Ok(block) = fl.alloc() {
                    let min_buddy_exp = self
                        .bias
                        .iter()
                        .find(|b| b.exp == t)
                        .map(|b| b.min_buddy_exp)
                        .unwrap_or(PAGE_SIZE_LOWEST_EXPONENT);
                    let buddy = Buddy::new();
                    unsafe {
                        buddy.add(block, t, min_buddy_exp)?;
                    }
                    let result = buddy.alloc(size);
                    self.buddies.lock().push((t, buddy));
                    if let Ok(p) = result {
                        return Ok(p);
                    }
                }
            }
        }

        Err(KmmError::OutOfMemory)
    }

    fn free(&self, p: u64) -> KmmResult<u64> {
        {
            let buddies = self.buddies.lock();
            for (_, b) in buddies.iter() {
                if let Ok(sz) = b.free(p) {
                    return Ok(sz);
                }
            }
        }
        for (exp, fl) in &self.freelists {
            if fl.free(p).is_ok() {
                return Ok(1u64 << exp);
            }
        }
        if self.fast_pages.free(p).is_ok() {
            return Ok(1u64 << PAGE_SIZE_LOWEST_EXPONENT);
        }
        Err(KmmError::NotFound)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    Low,
    High,
}

/// Physical memory manager: two independent low/high regions, each with
/// its own bias-driven freelist/buddy tables and fast-page pool.
pub struct Pmm {
    low: PmmRegion,
    high: PmmRegion,
    low_mem_limit: u64,
}

impl Pmm {
    /// Bootstraps both regions from `map` in one pass. `bias_low`/`bias_high`
    /// are evaluated independently against only the entries that fall on
    /// their side of `low_mem_limit`.
    pub fn init(map: &[MemoryMapEntry], low_mem_limit: u64, bias_low: &BiasTable, bias_high: &BiasTable) -> KmmResult<Self> {
        let low = PmmRegion::carve(map, low_mem_limit, PmmRegionKind::Low, bias_low)?;
        let high = PmmRegion::carve(map, low_mem_limit, PmmRegionKind::High, bias_high)?;
        Ok(Pmm { low, high, low_mem_limit })
    }

    pub fn alloc(&self, size: u64, region: Region) -> KmmResult<u64> {
        match region {
            Region::Low => self.low.alloc(size),
            Region::High => self.high.alloc(size),
        }
    }

    /// Frees `p`, trying the high region first (the common case) and
    /// falling back to low.
    pub fn free(&self, p: u64) -> KmmResult<u64> {
        match self.high.free(p) {
            Ok(sz) => Ok(sz),
            Err(KmmError::NotFound) => self.low.free(p),
            Err(err) => Err(err),
        }
    }

    pub fn fast_page_alloc(&self, region: Region) -> KmmResult<u64> {
        match region {
            Region::Low => self.low.fast_pages.alloc(),
            Region::High => self.high.fast_pages.alloc(),
        }
    }

    pub fn fast_page_free(&self, p: u64) -> KmmResult<()> {
        self.high.fast_pages.free(p).or_else(|_| self.low.fast_pages.free(p))
    }

    pub fn low_mem_limit(&self) -> u64 {
        self.low_mem_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    // Host-mock builds run with `HHDM_OFFSET = 0`, so `hhdm::to_hhdm` is the
    // identity function and a mmap entry's `base` is used as a raw pointer
    // directly. Tests therefore source `base` from real allocations rather
    // than literal physical-looking constants like `0` or `0x10_0000`,
    // which would not name valid memory on the host.
    fn backing(len: usize, align: usize) -> u64 {
        let layout = core::alloc::Layout::from_size_align(len, align).unwrap();
        unsafe { alloc::alloc::alloc_zeroed(layout) as u64 }
    }

    /// S4: memory map `[{0,1MiB,Available},{1MiB,15MiB,Available},{16MiB,16MiB,Reserved}]`,
    /// low-limit 1 MiB, bias high `[{21,1,1/2,12},{12,1,1/2,12}]`, bias low
    /// `[{12,1,1/1,12}]`. The map's addresses are relocated onto a real
    /// backing allocation while preserving the spec's relative offsets.
    #[test]
    fn s4_pmm_bootstrap() {
        let phys = backing(32 * MIB as usize, 1 << 21);
        let low_mem_limit = phys + MIB;
        let map = [
            MemoryMapEntry { base: phys, len: MIB, kind: MemoryKind::Available },
            MemoryMapEntry { base: phys + MIB, len: 15 * MIB, kind: MemoryKind::Available },
            MemoryMapEntry { base: phys + 16 * MIB, len: 16 * MIB, kind: MemoryKind::Reserved },
        ];
        let bias_low = BiasTable::new(alloc::vec![BiasEntry {
            exp: 12,
            min_blocks: 1,
            ratio_num: 1,
            ratio_den: 1,
            min_buddy_exp: 12,
        }]);
        let bias_high = BiasTable::new(alloc::vec![
            BiasEntry { exp: 21, min_blocks: 1, ratio_num: 1, ratio_den: 2, min_buddy_exp: 12 },
            BiasEntry { exp: 12, min_blocks: 1, ratio_num: 1, ratio_den: 2, min_buddy_exp: 12 },
        ]);

        let pmm = Pmm::init(&map, low_mem_limit, &bias_low, &bias_high).unwrap();

        // Low region got a 4 KiB-object freelist over essentially all of
        // [phys, phys + 1 MiB).
        let low_page = pmm.alloc(4096, Region::Low).unwrap();
        assert!(low_page < low_mem_limit);

        // High region's 2 MiB class exists and is allocatable.
        let big = pmm.alloc(2 * MIB, Region::High).unwrap();
        assert!(big >= low_mem_limit);
        pmm.free(big).unwrap();

        // High region's residual bytes became fast pages.
        let fast = pmm.fast_page_alloc(Region::High).unwrap();
        assert!(fast >= low_mem_limit);
        pmm.fast_page_free(fast).unwrap();
    }

    /// A freelist region carved out of a page-aligned (not block-aligned)
    /// map entry must still hand `Buddy::add` a block-aligned base when a
    /// request falls through to a larger bias exponent.
    #[test]
    fn buddy_constructed_from_misaligned_freelist_block_is_block_aligned() {
        let phys = backing(16 * MIB as usize, 1 << 21);
        let low_mem_limit = phys;
        let map = [MemoryMapEntry { base: phys + MIB, len: 8 * MIB, kind: MemoryKind::Available }];
        let bias_low = BiasTable::new(alloc::vec![]);
        let bias_high = BiasTable::new(alloc::vec![
            BiasEntry { exp: 21, min_blocks: 1, ratio_num: 1, ratio_den: 2, min_buddy_exp: 12 },
            BiasEntry { exp: 12, min_blocks: 1, ratio_num: 1, ratio_den: 2, min_buddy_exp: 12 },
        ]);

        let pmm = Pmm::init(&map, low_mem_limit, &bias_low, &bias_high).unwrap();

        // e = 15 (32 KiB rounds up to the 32 KiB page exponent), no freelist
        // or buddy exists at 15, so this falls through to the 2 MiB (exp 21)
        // freelist and constructs a buddy over the popped block.
        let p = pmm.alloc(32 * 1024, Region::High).unwrap();
        pmm.free(p).unwrap();
    }

    #[test]
    fn alloc_reports_out_of_memory_when_no_bias_covers_size() {
        let phys = backing(MIB as usize, 4096);
        let map = [MemoryMapEntry { base: phys, len: MIB, kind: MemoryKind::Available }];
        let bias_low = BiasTable::new(alloc::vec![]);
        let bias_high = BiasTable::new(alloc::vec![BiasEntry {
            exp: 12,
            min_blocks: 1,
            ratio_num: 1,
            ratio_den: 1,
            min_buddy_exp: 12,
        }]);
        // low_mem_limit == phys so the single entry is classified as high;
        // Region::Low's bias table is empty, so it must report OOM without
        // ever touching the (nonexistent) low backing range.
        let pmm = Pmm::init(&map, phys, &bias_low, &bias_high).unwrap();
        assert_eq!(pmm.alloc(4096, Region::Low), Err(KmmError::OutOfMemory));
    }
}
