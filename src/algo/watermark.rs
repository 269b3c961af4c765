//! C1: bootstrap bump allocator. Append-only, no free. Used before any
//! heap exists; every other allocator's control blocks ultimately trace
//! back to one of these regions (or, once bootstrapped, to iallocator).

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::{KmmError, KmmResult};

/// One watermark region: `[base, ceil)` with a monotonically increasing
/// offset. The header occupies the first `size_of::<WatermarkMeta>()`
/// bytes of the region it describes, so `base` is already past it.
#[repr(C)]
pub struct WatermarkMeta {
    next: u64,
    base: u64,
    ceil: u64,
    off: AtomicU64,
}

impl WatermarkMeta {
    fn usable_len(&self) -> u64 {
        self.ceil - self.base
    }
}

/// Chain of watermark regions, promoted to head on exhaustion is not
/// necessary here (unlike the buddy/freelist chains) since a region never
/// becomes non-empty again; once exhausted it is permanently skipped.
pub struct Watermark {
    head: Mutex<u64>,
}

impl Watermark {
    pub const fn new() -> Self {
        Watermark { head: Mutex::new(0) }
    }

    /// Lays a [`WatermarkMeta`] header at `addr` describing `[addr, addr+len)`
    /// and pushes it onto the chain. `addr` must be a valid, exclusively
    /// owned, HHDM (or host-mock identity) address with at least
    /// `size_of::<WatermarkMeta>()` bytes available.
    ///
    /// # Safety
    /// `addr` must point to `len` writable bytes for the lifetime of this
    /// `Watermark`.
    pub unsafe fn init(&self, addr: u64, len: u64) -> KmmResult<()> {
        let header_size = core::mem::size_of::<WatermarkMeta>() as u64;
        if len <= header_size {
            return Err(KmmError::InvalidParameters);
        }

        let meta_ptr = addr as *mut WatermarkMeta;
        let mut head = self.head.lock();
        core::ptr::write(
            meta_ptr,
            WatermarkMeta {
                next: *head,
                base: addr + header_size,
                ceil: addr + len,
                off: AtomicU64::new(0),
            },
        );
        *head = addr;
        Ok(())
    }

    /// Bumps the first region with room for `n` bytes and returns the old
    /// top of that region. Region traversal is serialised by the order
    /// lock; the bump itself is a lock-free atomic fetch-add (the source
    /// leaves this racy, resolved here per the design notes).
    pub fn alloc(&self, n: u64) -> KmmResult<u64> {
        if n == 0 {
            return Err(KmmError::InvalidParameters);
        }

        let head = *self.head.lock();
        let mut cur = head;
        while cur != 0 {
            // SAFETY: every address on the chain was written by `init` and
            // lives for the lifetime of `self`.
            let meta = unsafe { &*(cur as *const WatermarkMeta) };
            loop {
                let off = meta.off.load(Ordering::Relaxed);
                let new_off = match off.checked_add(n) {
                    Some(v) => v,
                    None => break,
                };
                if new_off > meta.usable_len() {
                    break;
                }
                if meta
                    .off
                    .compare_exchange_weak(off, new_off, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(meta.base + off);
                }
            }
            cur = meta.next;
        }
        Err(KmmError::OutOfRegion)
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backing(len: usize) -> u64 {
        let layout = core::alloc::Layout::from_size_align(len, 16).unwrap();
        unsafe { alloc::alloc::alloc(layout) as u64 }
    }

    #[test]
    fn bumps_and_exhausts() {
        let wm = Watermark::new();
        let addr = backing(256);
        unsafe { wm.init(addr, 256).unwrap() };

        let header = core::mem::size_of::<WatermarkMeta>() as u64;
        let usable = 256 - header;

        let p1 = wm.alloc(64).unwrap();
        assert_eq!(p1, addr + header);
        let p2 = wm.alloc(64).unwrap();
        assert_eq!(p2, p1 + 64);

        // Drain the rest, then expect exhaustion.
        let remaining = usable - 128;
        let _ = wm.alloc(remaining).unwrap();
        assert_eq!(wm.alloc(1), Err(KmmError::OutOfRegion));
    }

    #[test]
    fn chains_multiple_regions() {
        let wm = Watermark::new();
        let a = backing(64);
        let b = backing(256);
        unsafe {
            wm.init(a, 64).unwrap();
            wm.init(b, 256).unwrap();
        }
        // Region `a` has almost no room; first alloc that doesn't fit in
        // `a` should fall through to `b` (the most recently init'd region,
        // pushed to head).
        let header = core::mem::size_of::<WatermarkMeta>() as u64;
        let big = wm.alloc(64 - header + 1);
        assert!(big.is_ok());
        assert!(big.unwrap() >= b + header);
    }
}
