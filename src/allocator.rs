//! C7 (first half): general-purpose kernel allocator. Routes by size —
//! small requests to the SLAB (C4), large ones to the PMM (C6) — and
//! exposes a [`GlobalAlloc`] impl so the embedding kernel can register this
//! crate as its `#[global_allocator]`, mirroring the teacher's
//! `mm/allocator.rs` `BuddyAllocator` + `GlobalAlloc` pairing.

use core::alloc::{GlobalAlloc, Layout};

use spin::Mutex;

use crate::algo::{Slab, SlabPageSource};
use crate::arch::PAGE_SIZE;
use crate::error::{KmmError, KmmResult};
use crate::pmm::{Pmm, Region};

static SLAB: Slab = Slab::new();
static PMM: Mutex<Option<Pmm>> = Mutex::new(None);

/// Feeds the general-purpose SLAB from the PMM's high region, per
/// `SPEC_FULL.md` §4.4's `expand` contract.
struct PmmPageSource;

impl SlabPageSource for PmmPageSource {
    fn alloc_pages(&self, len: u64) -> KmmResult<u64> {
        with_pmm(|pmm| pmm.alloc(len, Region::High))
    }
}

static PMM_PAGE_SOURCE: PmmPageSource = PmmPageSource;

/// Installs the process-wide PMM once PMM bootstrap (C6) has completed,
/// and wires the general-purpose SLAB to refill from it.
pub fn install_pmm(pmm: Pmm) {
    *PMM.lock() = Some(pmm);
    SLAB.set_page_source(&PMM_PAGE_SOURCE);
}

/// The process-wide SLAB singleton. `Slab::init`/`grow` are called during
/// `init_kmm`; ordinary code only ever calls `kalloc`/`kfree`.
pub fn slab() -> &'static Slab {
    &SLAB
}

fn with_pmm<R>(f: impl FnOnce(&Pmm) -> KmmResult<R>) -> KmmResult<R> {
    let guard = PMM.lock();
    match guard.as_ref() {
        Some(pmm) => f(pmm),
        None => Err(KmmError::InvalidParameters),
    }
}

/// Requests above `PAGE_SIZE / 2` route to the PMM; everything else goes
/// to the SLAB. Matches S5.
pub fn kalloc(size: u64) -> KmmResult<u64> {
    if size == 0 {
        return Err(KmmError::InvalidParameters);
    }
    if size > (PAGE_SIZE as u64) / 2 {
        with_pmm(|pmm| pmm.alloc(size, Region::High))
    } else {
        SLAB.alloc(size)
    }
}

/// Same routing as `kalloc`, on `size * count`. Not guaranteed to
/// zero-initialise (matches source behaviour: kernel callers zero
/// explicitly when they need to).
pub fn kcalloc(size: u64, count: u64) -> KmmResult<u64> {
    let total = size.checked_mul(count).ok_or(KmmError::InvalidParameters)?;
    kalloc(total)
}

/// Tries the SLAB first, then the PMM.
pub fn kfree(p: u64) -> KmmResult<()> {
    match SLAB.free(p) {
        Ok(()) => Ok(()),
        Err(KmmError::NotFound) => with_pmm(|pmm| pmm.free(p)).map(|_| ()),
        Err(err) => Err(err),
    }
}

pub fn krealloc(_p: u64, _new_size: u64) -> KmmResult<u64> {
    Err(KmmError::Unimplemented)
}

/// `GlobalAlloc` adapter over `kalloc`/`kfree`, for the embedding kernel to
/// register as `#[global_allocator]`.
pub struct KmmGlobalAlloc;

unsafe impl GlobalAlloc for KmmGlobalAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match kalloc(layout.size() as u64) {
            Ok(addr) => addr as *mut u8,
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let _ = kfree(ptr as u64);
    }
}

// S5 (general allocator routing) is exercised in `integration_tests.rs`
// rather than here: it needs the same process-wide `SLAB`/`PMM` singletons
// `init_kmm` installs, and running both a local and the integration test
// against those singletons in the same test binary would race.
