//! Architecture queries, modeled as a trait boundary (out of scope per the
//! component design: this crate consumes the contract, it does not own the
//! architecture layer).

/// Everything the allocators need to know about the machine they run on.
pub trait Arch: Send + Sync {
    /// Width, in bits, of a physical address on this machine. Used to clamp
    /// the PMM's bias-table walk so it never reasons about exponents beyond
    /// what the hardware can address.
    fn physical_address_width(&self) -> u32;

    /// Current timestamp counter reading, used only for log timestamps.
    fn rdtsc(&self) -> u64;
}

/// Page size in bytes. The source treats this as a compile-time constant;
/// every machine this crate currently targets uses 4 KiB pages.
pub const PAGE_SIZE: usize = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SIZE_LOWEST_EXPONENT: u32 = 12;

/// Boundary between "low" memory (legacy DMA-reachable, below 1 MiB) and
/// "high" memory used by the PMM's dual-table split.
pub const LOW_MEM_LIMIT: u64 = 0x10_0000;

/// Higher-half direct map offset: `HHDM(phys) = phys + HHDM_OFFSET`.
///
/// The source derives this from the boot protocol; here it is a crate-wide
/// constant the embedding kernel is expected to have already mapped. In
/// host-mock builds it is zero (identity map onto process memory).
#[cfg(not(any(test, feature = "host-mock")))]
pub const HHDM_OFFSET: u64 = 0xffff_8000_0000_0000;
#[cfg(any(test, feature = "host-mock"))]
pub const HHDM_OFFSET: u64 = 0;

/// Default architecture implementation, grounded in the teacher's
/// `core::arch::x86_64` cpuid use in `logger.rs` (`detect_tsc_frequency`)
/// and its `x86_64` crate dependency.
#[cfg(all(target_arch = "x86_64", not(any(test, feature = "host-mock"))))]
pub struct X86_64Arch;

#[cfg(all(target_arch = "x86_64", not(any(test, feature = "host-mock"))))]
impl Arch for X86_64Arch {
    fn physical_address_width(&self) -> u32 {
        // CPUID leaf 0x80000008, EAX[7:0] = physical address bits.
        unsafe {
            let leaf = core::arch::x86_64::__cpuid(0x8000_0008);
            (leaf.eax & 0xff).max(36)
        }
    }

    fn rdtsc(&self) -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() }
    }
}

/// Host-side mock used by `host-mock` builds and by the unit tests in every
/// `algo` module. Mirrors `tests/kernel`'s hardware-mock convention in the
/// teacher repo (a std-side stand-in for real hardware).
#[cfg(any(test, feature = "host-mock"))]
pub struct MockArch {
    pub phys_bits: u32,
}

#[cfg(any(test, feature = "host-mock"))]
impl Default for MockArch {
    fn default() -> Self {
        MockArch { phys_bits: 40 }
    }
}

#[cfg(any(test, feature = "host-mock"))]
impl Arch for MockArch {
    fn physical_address_width(&self) -> u32 {
        self.phys_bits
    }

    fn rdtsc(&self) -> u64 {
        0
    }
}
