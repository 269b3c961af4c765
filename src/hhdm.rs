//! Higher-half direct map address convention: `HHDM(phys) = phys + HHDM_OFFSET`.
//!
//! This crate's PMM (`pmm::PmmRegion::carve`) builds its freelists and
//! buddies directly from the raw boot memory map; it never inherits a head
//! pointer from an earlier boot-time allocator stage, so there is nothing
//! here that needs un-truncating before it's offset. See `DESIGN.md`.

use crate::arch::HHDM_OFFSET;

/// Physical address to HHDM virtual address.
#[inline]
pub const fn to_hhdm(phys: u64) -> u64 {
    phys + HHDM_OFFSET
}
