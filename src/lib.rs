//! Kernel memory manager: watermark, freelist, buddy, slab, iallocator,
//! PMM, general allocator + VMM facade, and an optional bank registry.
//!
//! This crate has no heap of its own to stand on when it starts; every
//! component above the watermark bootstraps out of the one below it. See
//! [`init_kmm`] for the fixed init order.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod algo;
pub mod allocator;
pub mod arch;
pub mod bank;
pub mod error;
pub mod hhdm;
pub mod iallocator;
pub mod logger;
pub mod pager;
pub mod pmm;
pub mod vmm;

#[cfg(test)]
mod integration_tests;

pub use algo::{buddy, freelist, slab, watermark};
pub use arch::Arch;
pub use error::KmmError;
pub use pager::{MapFlags, Pager};
pub use pmm::{BiasEntry, BiasTable, MemoryKind, MemoryMapEntry, Pmm};

use core::sync::atomic::{AtomicU8, Ordering};

use algo::Watermark;
use arch::PAGE_SIZE_LOWEST_EXPONENT;
use error::KmmResult;
use pmm::Region;

/// Strict boot-time init order for the process-wide singletons.
///
/// Transitions are explicit function calls, never static constructors:
/// `Cold -> WatermarkReady -> PmmFreelistsReady -> IallocatorReady ->
/// PmmBuddiesReady -> SlabReady -> Ready`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum KmmStage {
    Cold = 0,
    WatermarkReady = 1,
    PmmFreelistsReady = 2,
    IallocatorReady = 3,
    PmmBuddiesReady = 4,
    SlabReady = 5,
    Ready = 6,
}

impl KmmStage {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => KmmStage::Cold,
            1 => KmmStage::WatermarkReady,
            2 => KmmStage::PmmFreelistsReady,
            3 => KmmStage::IallocatorReady,
            4 => KmmStage::PmmBuddiesReady,
            5 => KmmStage::SlabReady,
            _ => KmmStage::Ready,
        }
    }
}

static KMM_STAGE: AtomicU8 = AtomicU8::new(0);

/// What policy corruption detection follows: halt immediately (early boot,
/// the default) or return a typed error once the kernel can afford to keep
/// running degraded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptionPolicy {
    Halt,
    ReturnError,
}

static CORRUPTION_POLICY: AtomicU8 = AtomicU8::new(0);

/// Marks the end of the boot window: corruption detected from this point on
/// returns an error to the caller instead of halting. Mirrors the teacher's
/// `logger::mark_init_started`. With the `halt-on-corruption` feature
/// enabled (the default), this has no effect on corruption policy — the
/// kernel has opted into always halting, even after boot.
pub fn mark_boot_complete() {
    #[cfg(not(feature = "halt-on-corruption"))]
    CORRUPTION_POLICY.store(1, Ordering::Release);
}

pub(crate) fn corruption_policy() -> CorruptionPolicy {
    match CORRUPTION_POLICY.load(Ordering::Acquire) {
        0 => CorruptionPolicy::Halt,
        _ => CorruptionPolicy::ReturnError,
    }
}

pub(crate) fn stage() -> KmmStage {
    KmmStage::from_u8(KMM_STAGE.load(Ordering::Acquire))
}

pub(crate) fn advance_stage(to: KmmStage) {
    KMM_STAGE.store(to as u8, Ordering::Release);
}

/// Reports corruption to the debug sink and, under `CorruptionPolicy::Halt`,
/// aborts the current context. Under `ReturnError` this is a no-op besides
/// logging; the caller is expected to propagate the `KmmError` it already has.
pub(crate) fn report_corruption(err: KmmError, where_: &str) {
    crate::kerror!("kmm: corruption detected in {}: {:?}", where_, err);
    if corruption_policy() == CorruptionPolicy::Halt {
        panic!("kmm: halting on corruption in {}: {:?}", where_, err);
    }
}

/// Process-wide pre-heap bootstrap allocator. Kept available for whatever
/// scratch data the embedding boot protocol needs before PMM/iallocator
/// exist; this crate's own PMM control tables are `Vec`s (see `pmm.rs`),
/// so nothing downstream of `init_kmm` draws from it by default.
static WATERMARK: Watermark = Watermark::new();

pub fn watermark() -> &'static Watermark {
    &WATERMARK
}

/// Brings the whole stack up in the fixed order `SPEC_FULL.md` §9 requires:
/// watermark -> PMM freelists -> iallocator -> PMM buddies (lazy, checkpointed
/// here) -> SLAB -> ready. `bootstrap` names a scratch region for the
/// watermark; `slab_lowest_exp` fixes the general allocator's SLAB size
/// classes; `slab_pages_per_list` is the default growth increment `Slab::expand`
/// draws from the PMM whenever `kalloc` finds a size class empty.
///
/// # Safety
/// `bootstrap.0` must point to `bootstrap.1` writable, exclusively owned
/// bytes for the process lifetime.
pub unsafe fn init_kmm(
    map: &[pmm::MemoryMapEntry],
    low_mem_limit: u64,
    bias_low: &pmm::BiasTable,
    bias_high: &pmm::BiasTable,
    bootstrap: (u64, u64),
    slab_lowest_exp: u32,
    slab_pages_per_list: u32,
) -> KmmResult<()> {
    if stage() != KmmStage::Cold {
        return Err(KmmError::InvalidParameters);
    }

    WATERMARK.init(bootstrap.0, bootstrap.1)?;
    advance_stage(KmmStage::WatermarkReady);

    let pmm = pmm::Pmm::init(map, low_mem_limit, bias_low, bias_high)?;
    advance_stage(KmmStage::PmmFreelistsReady);

    let page_size = 1u64 << PAGE_SIZE_LOWEST_EXPONENT;
    let seed_page = pmm
        .fast_page_alloc(Region::High)
        .or_else(|_| pmm.alloc(page_size, Region::High))?;
    iallocator::IALLOCATOR.init()?;
    iallocator::IALLOCATOR.seed(seed_page, page_size)?;
    advance_stage(KmmStage::IallocatorReady);

    // Buddies are constructed lazily by the PMM the first time a bias
    // exponent above a live freelist is requested; there is nothing further
    // to do here besides checkpoint the stage.
    advance_stage(KmmStage::PmmBuddiesReady);

    allocator::slab().init(slab_lowest_exp, slab_pages_per_list)?;
    let slab_seed = pmm
        .fast_page_alloc(Region::High)
        .or_else(|_| pmm.alloc(page_size, Region::High))?;
    allocator::slab().grow(slab_lowest_exp, slab_seed, page_size)?;
    advance_stage(KmmStage::SlabReady);

    // Registers the PMM as the SLAB's page source, so a `kalloc` that finds
    // its class empty can refill from it instead of failing outright.
    allocator::install_pmm(pmm);
    advance_stage(KmmStage::Ready);
    Ok(())
}
