//! C2: intrusive freelist of fixed-size objects. The in-band "next"
//! pointer of a free slot is the slot's own first eight bytes; there is no
//! external bookkeeping per object beyond the region header.
//!
//! A [`Freelist`] is the *chain* of same-`object_size` regions (what the
//! source calls `ARC_PFreelist`); each region is described by a
//! [`FreelistMeta`] header laid out at the start of the region itself.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::{KmmError, KmmResult};

const MAX_CONTIG_RETRIES: u32 = 16;

/// Header laid out at the base of a freelist region, reserving however
/// many object slots its own size requires.
#[repr(C)]
pub struct FreelistMeta {
    next: AtomicU64,
    base: u64,
    ceil: u64,
    object_size: u64,
    head: AtomicU64,
    free_count: AtomicU64,
    lock: Mutex<()>,
}

impl FreelistMeta {
    fn contains(&self, p: u64) -> bool {
        p >= self.base && p < self.ceil
    }
}

/// Chain of regions sharing one `object_size`. `head` names the first
/// region's header address (0 = empty chain); region-to-region traversal
/// never removes a link, so it is safe to walk without holding the order
/// lock except when deciding which region to promote to the front.
pub struct Freelist {
    head: Mutex<u64>,
}

impl Freelist {
    pub const fn new() -> Self {
        Freelist { head: Mutex::new(0) }
    }

    /// Lays a new region's header at `base` covering `[base, base+len)`,
    /// reserves `ceil(size_of::<FreelistMeta>() / object_size)` slots for
    /// the header, threads the remaining slots into a singly linked free
    /// list, and pushes the region onto this chain. Returns the region's
    /// header address.
    ///
    /// # Safety
    /// `base` must point to `len` writable, exclusively owned bytes.
    pub unsafe fn init(&self, base: u64, len: u64, object_size: u64) -> KmmResult<u64> {
        if object_size == 0 || !object_size.is_power_of_two() {
            return Err(KmmError::InvalidParameters);
        }
        let header_objs = (core::mem::size_of::<FreelistMeta>() as u64).div_ceil(object_size);
        let header_reserve = header_objs * object_size;
        if len <= header_reserve {
            return Err(KmmError::InvalidParameters);
        }

        let usable_base = base + header_reserve;
        let ceil = base + len;
        let n_slots = (ceil - usable_base) / object_size;

        let mut slot = usable_base;
        for _ in 0..n_slots {
            let next_slot = slot + object_size;
            let value = if next_slot < ceil { next_slot } else { 0 };
            core::ptr::write(slot as *mut u64, value);
            slot = next_slot;
        }

        let head_of_region = if n_slots > 0 { usable_base } else { 0 };

        let mut chain_head = self.head.lock();
        core::ptr::write(
            base as *mut FreelistMeta,
            FreelistMeta {
                next: AtomicU64::new(*chain_head),
                base: usable_base,
                ceil,
                object_size,
                head: AtomicU64::new(head_of_region),
                free_count: AtomicU64::new(n_slots),
                lock: Mutex::new(()),
            },
        );
        *chain_head = base;
        Ok(base)
    }

    /// Pops one object, promoting the first non-empty region to the head
    /// of the chain so subsequent allocations hit it immediately.
    pub fn alloc(&self) -> KmmResult<u64> {
        let found = {
            let mut chain_head = self.head.lock();
            let mut cur = *chain_head;
            let mut result = 0u64;
            while cur != 0 {
                // SAFETY: every address on the chain was written by `init`.
                let meta = unsafe { &*(cur as *const FreelistMeta) };
                if meta.free_count.load(Ordering::Relaxed) > 0 {
                    result = cur;
                    break;
                }
                cur = meta.next.load(Ordering::Relaxed);
            }
            if result != 0 && result != *chain_head {
                *chain_head = result;
            }
            result
        };

        if found == 0 {
            return Err(KmmError::OutOfMemory);
        }

        let meta = unsafe { &*(found as *const FreelistMeta) };
        let _region_guard = meta.lock.lock();
        let head = meta.head.load(Ordering::Relaxed);
        if head == 0 {
            return Err(KmmError::OutOfMemory);
        }
        let next = unsafe { core::ptr::read(head as *const u64) };
        meta.head.store(next, Ordering::Relaxed);
        meta.free_count.fetch_sub(1, Ordering::Relaxed);
        Ok(head)
    }

    /// Allocates `k` objects one at a time, restarting the run whenever two
    /// successive allocations are not exactly `object_size` apart. Fails
    /// after [`MAX_CONTIG_RETRIES`] restarts. Returns the lower of the
    /// first and last address in the surviving run.
    pub fn contig_alloc(&self, k: u64) -> KmmResult<u64> {
        self.contig_alloc_counting(k).0
    }

    fn contig_alloc_counting(&self, k: u64) -> (KmmResult<u64>, u32) {
        if k == 0 {
            return (Err(KmmError::InvalidParameters), 0);
        }
        let object_size = {
            let chain_head = *self.head.lock();
            if chain_head == 0 {
                return (Err(KmmError::OutOfMemory), 0);
            }
            unsafe { &*(chain_head as *const FreelistMeta) }.object_size
        };

        let mut fails = 0u32;
        loop {
            if fails >= MAX_CONTIG_RETRIES {
                return (Err(KmmError::OutOfMemory), fails);
            }

            let mut base = 0u64;
            let mut last = 0u64;
            let mut count = 0u64;
            let mut broke = false;

            while count < k {
                let a = match self.alloc() {
                    Ok(a) => a,
                    Err(_) => {
                        if count > 0 {
                            let _ = self.contig_free(base.min(last), count);
                        }
                        fails += 1;
                        broke = true;
                        break;
                    }
                };

                if count == 0 {
                    base = a;
                    last = a;
                } else if a.abs_diff(last) != object_size {
                    let _ = self.free(a);
                    let _ = self.contig_free(base.min(last), count);
                    fails += 1;
                    broke = true;
                    break;
                } else {
                    last = a;
                }
                count += 1;
            }

            if !broke {
                return (Ok(base.min(last)), fails);
            }
        }
    }

    /// Frees `p`, locating its owning region by walking the chain.
    pub fn free(&self, p: u64) -> KmmResult<()> {
        let meta_addr = {
            let chain_head = *self.head.lock();
            let mut cur = chain_head;
            let mut found = 0u64;
            while cur != 0 {
                let meta = unsafe { &*(cur as *const FreelistMeta) };
                if meta.contains(p) {
                    found = cur;
                    break;
                }
                cur = meta.next.load(Ordering::Relaxed);
            }
            found
        };

        if meta_addr == 0 {
            return Err(KmmError::NotFound);
        }

        let meta = unsafe { &*(meta_addr as *const FreelistMeta) };
        let _region_guard = meta.lock.lock();
        let old_head = meta.head.load(Ordering::Relaxed);
        unsafe { core::ptr::write(p as *mut u64, old_head) };
        meta.head.store(p, Ordering::Relaxed);
        meta.free_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Frees `count` consecutive objects starting at `address`.
    pub fn contig_free(&self, address: u64, count: u64) -> KmmResult<()> {
        let object_size = {
            let chain_head = *self.head.lock();
            if chain_head == 0 {
                return Err(KmmError::NotFound);
            }
            unsafe { &*(chain_head as *const FreelistMeta) }.object_size
        };
        for i in 0..count {
            self.free(address + i * object_size)?;
        }
        Ok(())
    }

    /// Appends `other`'s chain to the tail of `self`'s chain. Both chains
    /// must already contain at least one region, and the regions' object
    /// sizes must match.
    pub fn link(&self, other: &Freelist) -> KmmResult<()> {
        let my_head = *self.head.lock();
        let other_head = *other.head.lock();
        if my_head == 0 || other_head == 0 {
            return Err(KmmError::InvalidParameters);
        }

        let my_meta = unsafe { &*(my_head as *const FreelistMeta) };
        let other_meta = unsafe { &*(other_head as *const FreelistMeta) };
        if my_meta.object_size != other_meta.object_size {
            return Err(KmmError::ObjectSizeMismatch);
        }

        let mut cur = my_head;
        loop {
            let meta = unsafe { &*(cur as *const FreelistMeta) };
            let next = meta.next.load(Ordering::Relaxed);
            if next == 0 {
                meta.next.store(other_head, Ordering::Relaxed);
                break;
            }
            cur = next;
        }
        Ok(())
    }

    /// Total free objects across every region in the chain.
    pub fn free_count(&self) -> u64 {
        let mut cur = *self.head.lock();
        let mut total = 0u64;
        while cur != 0 {
            let meta = unsafe { &*(cur as *const FreelistMeta) };
            total += meta.free_count.load(Ordering::Relaxed);
            cur = meta.next.load(Ordering::Relaxed);
        }
        total
    }
}

impl Default for Freelist {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate alloc;

    fn backing(len: usize) -> u64 {
        let layout = core::alloc::Layout::from_size_align(len, 64).unwrap();
        unsafe { alloc::alloc::alloc_zeroed(layout) as u64 }
    }

    fn header_reserve(object_size: u64) -> u64 {
        (core::mem::size_of::<FreelistMeta>() as u64).div_ceil(object_size) * object_size
    }

    /// S1: region of 16 slots, object size 64.
    #[test]
    fn s1_freelist_pop_push() {
        let object_size = 64u64;
        let len = header_reserve(object_size) + 16 * object_size;
        let fl = Freelist::new();
        unsafe { fl.init(backing(len as usize), len, object_size).unwrap() };

        let p1 = fl.alloc().unwrap();
        let p2 = fl.alloc().unwrap();
        let p3 = fl.alloc().unwrap();
        assert_ne!(p1, p2);
        assert_ne!(p2, p3);

        fl.free(p2).unwrap();
        assert_eq!(fl.free_count(), 14);

        let reused = fl.alloc().unwrap();
        assert_eq!(reused, p2);
        assert_eq!(fl.free_count(), 13);
    }

    /// S3: after 16 non-adjacent partial runs, contig_alloc fails having
    /// tried exactly 16 times.
    #[test]
    fn s3_contig_alloc_retry_limit() {
        let object_size = 64u64;
        // Plenty of slots so running out of memory never masks the retry
        // limit itself.
        let len = header_reserve(object_size) + 4096 * object_size;
        let fl = Freelist::new();
        unsafe { fl.init(backing(len as usize), len, object_size).unwrap() };

        // Interleave frees between the low and high half of a 64-object
        // pool so the LIFO free-list order never resumes address order:
        // every consecutive pop differs by roughly half the pool's span,
        // never by exactly one `object_size`.
        let mut pool = alloc::vec::Vec::new();
        for _ in 0..64 {
            pool.push(fl.alloc().unwrap());
        }
        for i in 0..32 {
            fl.free(pool[i]).unwrap();
            fl.free(pool[i + 32]).unwrap();
        }

        let (result, fails) = fl.contig_alloc_counting(8);
        assert_eq!(fails, 16);
        assert_eq!(result, Err(KmmError::OutOfMemory));
    }

    #[test]
    fn link_rejects_object_size_mismatch() {
        let a = Freelist::new();
        let b = Freelist::new();
        let len_a = header_reserve(32) + 8 * 32;
        let len_b = header_reserve(64) + 8 * 64;
        unsafe {
            a.init(backing(len_a as usize), len_a, 32).unwrap();
            b.init(backing(len_b as usize), len_b, 64).unwrap();
        }
        assert_eq!(a.link(&b), Err(KmmError::ObjectSizeMismatch));
    }

    #[test]
    fn free_unknown_address_not_found() {
        let object_size = 64u64;
        let len = header_reserve(object_size) + 4 * object_size;
        let fl = Freelist::new();
        unsafe { fl.init(backing(len as usize), len, object_size).unwrap() };
        assert_eq!(fl.free(0xdead_beef), Err(KmmError::NotFound));
    }
}
